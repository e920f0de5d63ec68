// Sonance
// Copyright (C) 2021  Wesley Merkel
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Turning calls like `play 60, release: 2` into synths on the engine.
//!
//! Every trigger goes through the same pipeline: the thread's defaults are merged in, notes are
//! tuned, arguments are normalised to numbers and scaled to the BPM, and the synth is started in
//! the thread's current group, writing to its current bus, stamped with its logical time.

use crate::{
    args::{
        add_arg_slide_times, calculate_sustain, normalise, resolve_midi_args,
        scale_time_args_to_bpm, Args,
    },
    context::Context,
    error::{Error, Result},
    node::{ChordGroup, MoveAction, Node, SoundHandle},
    note,
    studio::{Position, Timing},
    synth_info::{ClockMode, SynthInfo, SynthKind},
    tracker::{SynthTracker, Tracked},
    value::Value,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

/// The synth definition name for a synth, which external synths use as is.
pub(crate) fn synthdef_name(name: &str, info: Option<&'static SynthInfo>) -> String {
    match info {
        Some(info) => info.scsynth_name(),
        None => name.to_owned(),
    }
}

impl Context {
    /// Plays a note, or a chord if given a list, with the current synth.
    pub fn play(&mut self, note: impl Into<Value>, mut args: Args) -> Result<SoundHandle> {
        args.insert("note", note);
        let synth = self.musical.synth.clone();
        self.synth(&synth, args)
    }

    /// Plays each note of a chord at once with the current synth.
    pub fn play_chord(&mut self, notes: Vec<Value>, args: Args) -> Result<SoundHandle> {
        self.play(Value::List(notes), args)
    }

    /// Plays the notes one after another, a beat apart.
    pub fn play_pattern(&mut self, notes: &[Value], args: Args) -> Result<()> {
        self.play_pattern_timed(notes, &[1.0], args)
    }

    /// Plays the notes one after another, sleeping between them for the times given, which
    /// wrap around when there are fewer times than notes. Each note lasts as long as the sleep
    /// after it.
    pub fn play_pattern_timed(&mut self, notes: &[Value], times: &[f64], args: Args) -> Result<()> {
        if times.is_empty() {
            return Err(Error::invalid("play_pattern_timed needs at least one time"));
        }
        for (i, note) in notes.iter().enumerate() {
            let time = note::ring_get(times, i as i64).copied().unwrap_or(1.0);
            self.play(note.clone(), args.clone().with("duration", time))?;
            if i + 1 < notes.len() {
                self.sleep(time)?;
            }
        }
        Ok(())
    }

    /// Triggers a named synth. A `note` of `nil`, `:r` or `:rest` is a rest, and a list of
    /// notes is played as a chord.
    pub fn synth(&mut self, name: &str, args: Args) -> Result<SoundHandle> {
        self.check_killed()?;
        let info = SynthInfo::get(name).filter(|info| info.kind == SynthKind::Synth);
        if info.is_none() && !self.musical.external_synths {
            return Err(Error::UnknownSynth(name.to_owned()));
        }
        let mut args = self.musical.synth_defaults.merged(&args);

        if args.get("note").map_or(false, |note| note.resolve().is_rest()) {
            self.describe(format!("synth :{}, {{note: :rest}}", name));
            return Ok(SoundHandle::blank(args));
        }

        let info = match info {
            Some(info) => info,
            None => return self.trigger_inst(name, None, args),
        };

        let notes = args
            .get("notes")
            .or_else(|| args.get("note"))
            .map(Value::resolve);
        let pitch = args.get_f64("pitch").unwrap_or(0.0);
        if let Some(Value::List(notes)) = notes {
            args.remove("notes");
            args.remove("note");
            let mut tuned = Vec::with_capacity(notes.len());
            for note in notes.iter() {
                if let Some(n) = note::note(note)? {
                    tuned.push(self.tune_note(n + pitch));
                }
            }
            return self.trigger_chord(name, info, tuned, args);
        }

        let n = match args.get("note") {
            Some(note) => note::note(note)?,
            None => info.default_for("note").and_then(|note| note.as_f64()),
        }
        .unwrap_or(52.0);
        args.insert("note", self.tune_note(n + pitch));
        self.trigger_inst(name, Some(info), args)
    }

    /// Like [`Context::synth`], also running `block` with the new sound on a thread of its own.
    /// The thread is killed when the sound ends.
    pub fn synth_with<F>(&mut self, name: &str, args: Args, block: F) -> Result<SoundHandle>
    where
        F: FnOnce(&mut Context, SoundHandle) -> Result<()> + Send + 'static,
    {
        let handle = self.synth(name, args)?;
        let for_block = handle.clone();
        let thread = self.in_thread(None, move |ctx| block(ctx, for_block))?;
        handle.on_destroyed(move || {
            let spawned = thread::Builder::new()
                .name("synth-block-kill".to_owned())
                .spawn(move || thread.kill());
            if let Err(err) = spawned {
                log::error!("failed to spawn thread to kill synth block: {}", err);
            }
        });
        Ok(handle)
    }

    /// Purges `nil`s, converts note names, normalises to numbers, fills in `sustain` and scales
    /// time arguments to the BPM.
    pub(crate) fn resolve_args(
        &self,
        info: Option<&'static SynthInfo>,
        mut args: Args,
    ) -> Result<Args> {
        args.purge_nils();
        let defaults = info.map(SynthInfo::arg_defaults).unwrap_or_default();
        if let Some(info) = info {
            resolve_midi_args(&mut args, info)?;
        }
        normalise(&mut args, &defaults)?;
        calculate_sustain(&mut args);
        if let Some(info) = info {
            if self.musical.arg_bpm_scaling {
                scale_time_args_to_bpm(&mut args, info, self.clock.sleep_mul(), true);
            }
        }
        Ok(args)
    }

    fn trigger_inst(
        &mut self,
        name: &str,
        info: Option<&'static SynthInfo>,
        args: Args,
    ) -> Result<SoundHandle> {
        let mut args = self.resolve_args(info, args)?;
        if self.out_of_time() {
            self.serious_warning(format!("!! Out of time, skipping: synth :{}, {}", name, args));
            return Ok(SoundHandle::blank(args));
        }
        self.describe(format!("synth :{}, {}", name, args));
        if let Some(info) = info {
            add_arg_slide_times(&mut args, info);
        }
        let group = self.current_group()?;
        let out_bus = self.current_out_bus()?;
        self.trigger_synth(&synthdef_name(name, info), &group, args, info, out_bus)
    }

    /// Starts a synth whose arguments are fully resolved, unless its `on` argument is falsy.
    pub(crate) fn trigger_synth(
        &mut self,
        synthdef: &str,
        group: &Node,
        mut args: Args,
        info: Option<&'static SynthInfo>,
        out_bus: i32,
    ) -> Result<SoundHandle> {
        args.insert("out_bus", out_bus);
        if self.musical.arg_checks {
            if let Some(info) = info {
                info.validate(&args)?;
            }
        }
        if let Some(on) = args.remove("on") {
            if !on.is_truthy() {
                return Ok(SoundHandle::blank(args));
            }
        }
        let node = self.start_synth(
            synthdef,
            group,
            &args,
            info,
            ClockMode::Logical,
            Position::Tail,
        )?;
        let handle = SoundHandle::Synth(node);
        self.locals.last_triggered = Some(handle.clone());
        Ok(handle)
    }

    /// When a trigger stamped with `clock` should be played.
    pub(crate) fn timing_for(&self, clock: ClockMode) -> Timing {
        match clock {
            ClockMode::Now => Timing::Now,
            ClockMode::Logical => Timing::At(self.clock.sched_time()),
            ClockMode::MinusDelta => {
                let delta = self.runtime().config().control_delta;
                Timing::At(self.clock.sched_time() - std::time::Duration::from_secs_f64(delta))
            }
        }
    }

    fn trackers(&self) -> Vec<SynthTracker> {
        self.locals
            .fx_tracker
            .iter()
            .cloned()
            .chain(Some(self.locals.tracker.clone()))
            .collect()
    }

    /// Sends the trigger and tracks the synth until it ends or moves out of its group.
    pub(crate) fn start_synth(
        &mut self,
        synthdef: &str,
        group: &Node,
        args: &Args,
        info: Option<&'static SynthInfo>,
        clock: ClockMode,
        position: Position,
    ) -> Result<Node> {
        self.ensure_good_timing()?;
        let timing = self.timing_for(clock);
        let trackers = self.trackers();
        let studio = self.studio().clone();
        self.no_kill(move |_| {
            let node = studio.trigger_synth(synthdef, group, args, info, timing, position)?;
            let tracked = Tracked::Synth(node.id());
            for tracker in trackers.iter() {
                tracker.synth_started(tracked);
            }
            let on_move = trackers.clone();
            node.on_next_move(move |_| {
                for tracker in on_move.iter() {
                    tracker.synth_finished(tracked);
                }
                MoveAction::Done
            });
            node.on_destroyed(move || {
                for tracker in trackers.iter() {
                    tracker.synth_finished(tracked);
                }
            });
            Ok(node)
        })
    }

    fn trigger_chord(
        &mut self,
        name: &str,
        info: &'static SynthInfo,
        notes: Vec<f64>,
        args: Args,
    ) -> Result<SoundHandle> {
        let mut args = self.resolve_args(Some(info), args)?;
        let shown = Args::new()
            .with("note", Value::list(notes.clone()))
            .merged(&args);
        if self.out_of_time() {
            self.serious_warning(format!("!! Out of time, skipping: synth :{}, {}", name, shown));
            return Ok(SoundHandle::blank(args));
        }
        self.describe(format!("synth :{}, {}", name, shown));
        add_arg_slide_times(&mut args, info);
        if notes.is_empty() {
            return Ok(SoundHandle::blank(args));
        }

        let amp = args.get_f64("amp").unwrap_or(1.0);
        args.insert("amp", amp / notes.len() as f64);

        let parent = self.current_group()?;
        let out_bus = self.current_out_bus()?;
        let group = self.studio().new_group(Position::Tail, &parent, "CHORD")?;
        let synthdef = info.scsynth_name();

        let mut nodes = Vec::with_capacity(notes.len());
        for n in notes.iter() {
            let note_args = args.clone().with("note", *n);
            let handle = self.trigger_synth(&synthdef, &group, note_args, Some(info), out_bus)?;
            if let SoundHandle::Synth(node) = handle {
                nodes.push(node);
            }
        }

        // The chord's group goes once every note in it has ended.
        let remaining = Arc::new(AtomicUsize::new(nodes.len()));
        for node in nodes.iter() {
            let remaining = Arc::clone(&remaining);
            let group = group.clone();
            let studio = self.studio().clone();
            node.on_destroyed(move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if let Err(err) = studio.kill(&group, Timing::Now) {
                        log::error!("failed to free chord group {}: {}", group.id(), err);
                    }
                }
            });
        }
        if nodes.is_empty() {
            self.studio().kill(&group, Timing::Now)?;
        }

        let chord = SoundHandle::Chord(ChordGroup {
            group,
            notes,
            nodes,
            info: Some(info),
        });
        self.locals.last_triggered = Some(chord.clone());
        Ok(chord)
    }

    /// Changes the arguments of a running sound, or of the last sound this thread triggered.
    ///
    /// Controlling a chord with a list of `notes` gives each synth in the chord the next note,
    /// wrapping around. Returns the sound controlled.
    pub fn control(
        &mut self,
        handle: Option<&SoundHandle>,
        args: Args,
    ) -> Result<Option<SoundHandle>> {
        self.check_killed()?;
        let handle = match handle.or_else(|| self.locals.last_triggered.as_ref()) {
            Some(SoundHandle::Lazy(lazy)) => match lazy.resolve() {
                Some(handle) => handle,
                None => return Ok(None),
            },
            Some(handle) => handle.clone(),
            None => return Ok(None),
        };
        if handle.is_blank() {
            return Ok(Some(handle));
        }
        let mut args = args;
        if let Some(on) = args.remove("on") {
            if !on.is_truthy() {
                return Ok(Some(handle));
            }
        }

        let info = handle.info();
        let defaults = info.map(SynthInfo::arg_defaults).unwrap_or_default();
        if let Some(info) = info {
            resolve_midi_args(&mut args, info)?;
            add_arg_slide_times(&mut args, info);
            if self.musical.arg_bpm_scaling {
                scale_time_args_to_bpm(&mut args, info, self.clock.sleep_mul(), false);
            }
        }
        let pitch = args.get_f64("pitch").unwrap_or(0.0);

        let mut chord_notes = None;
        if let SoundHandle::Chord(_) = handle {
            let note = args.remove("note");
            let notes = args.remove("notes").or(note);
            normalise(&mut args, &defaults)?;
            if let Some(notes) = notes {
                let notes = match notes.resolve() {
                    Value::List(notes) => notes,
                    single => vec![single],
                };
                let mut tuned = Vec::with_capacity(notes.len());
                for note in notes.iter() {
                    if let Some(n) = note::note(note)? {
                        tuned.push(self.tune_note(n + pitch));
                    }
                }
                chord_notes = Some(tuned);
            }
        } else {
            if let Some(note) = args.get("note").cloned() {
                match note::note(&note)? {
                    Some(n) => args.insert("note", self.tune_note(n + pitch)),
                    None => args.remove("note"),
                };
            }
            normalise(&mut args, &defaults)?;
        }

        if self.musical.arg_checks {
            if let Some(info) = info {
                info.ctl_validate(&args)?;
            }
        }

        let id = handle.id().unwrap_or(-1);
        let shown = match &chord_notes {
            Some(notes) => args.clone().with("notes", Value::list(notes.clone())),
            None => args.clone(),
        };
        if self.out_of_time() {
            self.serious_warning(format!(
                "!! Out of time, skipping: control node {}, {}",
                id, shown
            ));
            return Ok(Some(handle));
        }

        let timing = self.timing_for(ClockMode::Logical);
        match (&handle, chord_notes) {
            (SoundHandle::Chord(chord), Some(notes)) if !notes.is_empty() => {
                for (i, node) in chord.nodes.iter().enumerate() {
                    let mut node_args = args.clone();
                    if let Some(n) = note::ring_get(&notes, i as i64) {
                        node_args.insert("note", *n);
                    }
                    self.studio().control(node, &node_args, timing)?;
                }
            }
            _ => {
                if let Some(node) = handle.node() {
                    self.studio().control(&node, &args, timing)?;
                }
            }
        }
        self.describe(format!("control node {}, {}", id, shown));
        Ok(Some(handle))
    }

    /// Stops a sound. Returns whether it was still playing.
    pub fn kill(&mut self, handle: &SoundHandle) -> Result<bool> {
        let node = match handle.node() {
            Some(node) => node,
            None => return Ok(false),
        };
        let alive = node.is_alive();
        let timing = self.timing_for(ClockMode::Logical);
        self.studio().kill(&node, timing)?;
        if alive {
            self.message(format!("killing sound {}", node.id()));
        } else {
            self.message(format!("not killing sound {} (already killed)", node.id()));
        }
        Ok(alive)
    }

    /// Plays a live audio input, identified by `id`.
    ///
    /// Only one synth exists per id. Calling this again for a running id changes its arguments
    /// and moves it into the current group instead. A `stereo` argument selects the stereo
    /// input synth.
    pub fn live_audio(&mut self, id: &str, mut args: Args) -> Result<SoundHandle> {
        self.check_killed()?;
        let stereo = args.remove("stereo").map_or(false, |stereo| stereo.is_truthy());
        let name = if stereo { "sound_in_stereo" } else { "sound_in" };
        let info = SynthInfo::get(name);
        let mut args = self.resolve_args(info, args)?;
        self.describe(format!("live_audio :{}, {}", id, args));

        let group = self.current_group()?;
        args.insert("out_bus", self.current_out_bus()?);
        if self.musical.arg_checks {
            if let Some(info) = info {
                info.validate(&args)?;
            }
        }
        if let Some(on) = args.remove("on") {
            if !on.is_truthy() {
                return Ok(SoundHandle::blank(args));
            }
        }
        self.ensure_good_timing()?;

        let timing = self.timing_for(ClockMode::Logical);
        let group_id = group.id();
        let trackers = self.trackers();
        let on_destroy_trackers = trackers.clone();
        let studio = self.studio().clone();
        let synthdef = synthdef_name(name, info);
        let node = self.no_kill(|_| {
            studio.trigger_live_synth(
                id,
                &synthdef,
                &group,
                &args,
                info,
                timing,
                |node| {
                    let tracked = Tracked::LiveSynth {
                        node_id: node.id(),
                        group_id,
                    };
                    node.on_destroyed_keyed("live-audio", move || {
                        for tracker in on_destroy_trackers.iter() {
                            tracker.synth_finished(tracked);
                        }
                    });
                },
                |node| {
                    let tracked = Tracked::LiveSynth {
                        node_id: node.id(),
                        group_id,
                    };
                    for tracker in trackers.iter() {
                        tracker.synth_started(tracked);
                    }
                    node.on_next_move(move |moved| {
                        if moved.parent_group_id == group_id {
                            return MoveAction::Keep;
                        }
                        for tracker in trackers.iter() {
                            tracker.synth_finished(tracked);
                        }
                        MoveAction::Done
                    });
                },
            )
        })?;
        let handle = SoundHandle::Synth(node);
        self.locals.last_triggered = Some(handle.clone());
        Ok(handle)
    }

    /// Stops a live audio input. Returns whether it was playing.
    pub fn live_audio_stop(&mut self, id: &str) -> Result<bool> {
        let stopped = self.studio().kill_live_synth(id)?;
        if stopped {
            self.describe(format!("live_audio :{}, :stop", id));
        }
        Ok(stopped)
    }
}
