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

//! FX blocks.
//!
//! `with_fx` gives its block a fresh bus to play into and starts an FX synth reading that bus and
//! writing to wherever the block's sounds would otherwise have gone. The FX synth and a group for
//! the block's synths share a container group:
//!
//! ```text
//! current group
//! └── Run-<job>-<fx>            container, freed last
//!     ├── Run-<job>-<fx>-synths the block's synths, at the head so they run first
//!     └── sonic-pi-fx_<fx>      the FX synth, at the tail
//! ```
//!
//! The block runs on the calling thread. Once it returns, a collector thread waits for every
//! thread the block started and every synth it triggered to finish, waits the FX's kill delay
//! so reverb tails and echoes can ring out, and frees the container.

use crate::{
    args::{add_arg_slide_times, Args},
    bus::AudioBus,
    clock::TimeSource,
    context::{Context, ThreadHandle},
    error::{Error, Result},
    node::{FxNode, Node, SoundHandle},
    promise::Promise,
    studio::{Position, Studio, Timing},
    synth_info::{ClockMode, SynthInfo, SynthKind},
    tracker::SynthTracker,
};
use crossbeam_channel::select;
use std::{collections::HashSet, sync::Arc, thread, time::Duration};

struct FxSetup {
    handle: SoundHandle,
    synth_group: Node,
    bus: AudioBus,
    tracker: SynthTracker,
}

impl Context {
    /// Runs `block` with everything it plays passed through the named FX.
    ///
    /// `reps` repeats the block, `kill_delay` overrides how long the FX outlives the block's
    /// sounds, and a falsy `on` skips the FX, as does the name `none`. The block is given the FX
    /// so it can be controlled.
    pub fn with_fx<F>(&mut self, name: &str, mut args: Args, mut block: F) -> Result<()>
    where
        F: FnMut(&mut Context, &SoundHandle) -> Result<()>,
    {
        self.check_killed()?;
        let reps = args
            .remove("reps")
            .and_then(|reps| reps.as_f64())
            .unwrap_or(1.0)
            .max(0.0) as usize;
        let kill_delay = args.remove("kill_delay").and_then(|delay| delay.as_f64());
        let on = args.remove("on").map_or(true, |on| on.is_truthy());
        if name == "none" || !on {
            return self.bypass_fx(reps, args, &mut block);
        }

        let fx_name = format!("fx_{}", name);
        let info = SynthInfo::get(&fx_name).filter(|info| info.kind == SynthKind::Fx);
        let synthdef = match info {
            Some(info) => info.scsynth_name(),
            None if self.musical.external_synths => name.to_owned(),
            None => return Err(Error::UnknownFx(name.to_owned())),
        };

        let group = self.current_group()?;
        let out_bus = self.current_out_bus()?;
        let mut args = self.resolve_args(info, args)?;
        if let Some(info) = info {
            add_arg_slide_times(&mut args, info);
        }
        args.insert("out_bus", out_bus);
        let kill_delay = kill_delay
            .or_else(|| info.and_then(|info| info.kill_delay(&args)))
            .unwrap_or(self.runtime().config().default_kill_delay);

        let fx_done: Promise<Vec<ThreadHandle>> = Promise::new();
        let collecting: Promise<()> = Promise::new();
        let setup = self.no_kill(|ctx| {
            ctx.start_fx(
                name,
                &synthdef,
                info,
                &group,
                args.clone(),
                kill_delay,
                fx_done.clone(),
                collecting.clone(),
            )
        })?;
        let setup = match setup {
            Some(setup) => setup,
            None => {
                self.serious_warning("All busses allocated - unable to honour FX");
                return self.bypass_fx(reps, args, &mut block);
            }
        };

        let previous_group = self.locals.group.replace(setup.synth_group.clone());
        let previous_bus = self.locals.out_bus.replace(setup.bus.to_i32());
        let previous_tracker = self.locals.fx_tracker.replace(setup.tracker.clone());
        let existing: HashSet<u64> = self
            .thread()
            .subthreads()
            .iter()
            .map(ThreadHandle::id)
            .collect();

        let mut result = Ok(());
        for _ in 0..reps {
            result = block(self, &setup.handle);
            if result.is_err() {
                break;
            }
        }

        let started: Vec<ThreadHandle> = self
            .thread()
            .subthreads()
            .into_iter()
            .filter(|thread| !existing.contains(&thread.id()))
            .collect();
        fx_done.deliver(started);
        self.locals.group = previous_group;
        self.locals.out_bus = previous_bus;
        self.locals.fx_tracker = previous_tracker;

        collecting.get();
        result
    }

    fn bypass_fx<F>(&mut self, reps: usize, args: Args, block: &mut F) -> Result<()>
    where
        F: FnMut(&mut Context, &SoundHandle) -> Result<()>,
    {
        let blank = SoundHandle::blank(args);
        for _ in 0..reps {
            block(self, &blank)?;
        }
        Ok(())
    }

    /// Allocates the bus, creates the groups, starts the FX synth and the collector thread.
    /// Returns `None` when no bus is free.
    #[allow(clippy::too_many_arguments)]
    fn start_fx(
        &mut self,
        name: &str,
        synthdef: &str,
        info: Option<&'static SynthInfo>,
        group: &Node,
        mut args: Args,
        kill_delay: f64,
        fx_done: Promise<Vec<ThreadHandle>>,
        collecting: Promise<()>,
    ) -> Result<Option<FxSetup>> {
        let studio = self.studio().clone();
        let bus = match studio.new_fx_bus() {
            Ok(bus) => bus,
            Err(Error::Allocation(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        args.insert("in_bus", bus.to_i32());
        if self.musical.arg_checks {
            if let Some(info) = info {
                if let Err(err) = info.validate(&args) {
                    bus.free();
                    return Err(err);
                }
            }
        }

        let container_name = format!("Run-{}-{}", self.job_id(), name);
        let container = match studio.new_group(Position::Tail, group, &container_name) {
            Ok(container) => container,
            Err(err) => {
                bus.free();
                return Err(err);
            }
        };
        let started = studio
            .new_group(Position::Head, &container, &format!("{}-synths", container_name))
            .and_then(|synth_group| {
                let clock = info.map_or(ClockMode::MinusDelta, |info| info.clock);
                let node =
                    self.start_synth(synthdef, &container, &args, info, clock, Position::Tail)?;
                Ok((synth_group, node))
            });
        let (synth_group, node) = match started {
            Ok(started) => started,
            Err(err) => {
                bus.free();
                if let Err(kill_err) = studio.kill(&container, Timing::Now) {
                    log::error!("failed to free FX group {}: {}", container.id(), kill_err);
                }
                return Err(err);
            }
        };
        {
            let bus = bus.clone();
            node.on_destroyed(move || bus.free());
        }

        let tracker = SynthTracker::new();
        let collector = Collector {
            parent: self.thread().clone(),
            tracker: tracker.clone(),
            container,
            kill_delay: Duration::from_secs_f64(kill_delay.max(0.0)),
            time: Arc::clone(self.clock.source()),
            studio,
            fx_done,
            collecting,
        };
        let spawned = thread::Builder::new()
            .name(format!("fx-gc-{}", name))
            .spawn(move || collector.run());
        if let Err(err) = spawned {
            bus.free();
            return Err(Error::Spawn(err));
        }

        let handle = SoundHandle::Fx(FxNode {
            node,
            in_bus: bus.clone(),
            out_bus: args.get_f64("out_bus").unwrap_or(0.0) as i32,
        });
        self.locals.last_triggered = Some(handle.clone());
        Ok(Some(FxSetup {
            handle,
            synth_group,
            bus,
            tracker,
        }))
    }
}

/// Frees an FX once its block and everything the block started have finished.
struct Collector {
    parent: ThreadHandle,
    tracker: SynthTracker,
    container: Node,
    kill_delay: Duration,
    time: Arc<dyn TimeSource>,
    studio: Studio,
    fx_done: Promise<Vec<ThreadHandle>>,
    collecting: Promise<()>,
}

impl Collector {
    fn run(self) {
        let started = select! {
            recv(self.fx_done.signal()) -> _ => self.fx_done.get(),
            // The block never reported back, so its thread died.
            recv(self.parent.finished_signal()) -> _ => self.parent.subthreads(),
        };
        self.collecting.deliver(());

        for thread in started.iter() {
            thread.join_all();
        }
        self.tracker.block_until_finished();
        let deadline = self.time.now() + self.kill_delay;
        self.time.wait_until(deadline, &crossbeam_channel::never());
        log::debug!("freeing FX group {}", self.container.id());
        if let Err(err) = self.studio.kill(&self.container, Timing::Now) {
            log::error!("failed to free FX group {}: {}", self.container.id(), err);
        }
    }
}
