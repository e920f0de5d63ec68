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

//! The state a thread of user code carries with it.
//!
//! Every thread running user code owns a [`Context`]: its musical settings, its logical clock,
//! where its sounds go, and the trigger descriptions it has not yet shown. A thread started with
//! [`Context::in_thread`] gets a copy of its parent's context as it was at that moment, so
//! settings changed afterwards in either thread do not leak into the other.

use crate::{
    args::Args,
    clock::{LogicalClock, Timeliness},
    error::{Error, Result},
    messages::{MessageKind, OutboundMessage},
    node::{Node, SoundHandle},
    note,
    promise::Promise,
    runtime::Runtime,
    studio::Studio,
    synth_info::{SynthInfo, SynthKind},
    tracker::SynthTracker,
    tuning::{Tuning, TuningSystem},
    value::Value,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

/// The settings that shape how a thread's sounds are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MusicalContext {
    pub synth: String,
    pub synth_defaults: Args,
    pub sample_defaults: Args,
    /// Semitones added to every note.
    pub transpose: f64,
    pub octave: i32,
    /// Cents added to every note, on top of the runtime's global cent tuning.
    pub cent_tuning: f64,
    pub tuning: Tuning,
    /// Skip triggers that would sound late instead of playing them.
    pub timing_guarantees: bool,
    pub timing_warnings: bool,
    pub arg_checks: bool,
    /// Whether trigger descriptions are shown.
    pub debug: bool,
    /// Accept synth and FX names the runtime has no metadata for.
    pub external_synths: bool,
    /// Scale time arguments with the BPM.
    pub arg_bpm_scaling: bool,
}

impl Default for MusicalContext {
    fn default() -> MusicalContext {
        MusicalContext {
            synth: "beep".to_owned(),
            synth_defaults: Args::new(),
            sample_defaults: Args::new(),
            transpose: 0.0,
            octave: 0,
            cent_tuning: 0.0,
            tuning: Tuning::default(),
            timing_guarantees: false,
            timing_warnings: true,
            arg_checks: true,
            debug: true,
            external_synths: false,
            arg_bpm_scaling: true,
        }
    }
}

impl MusicalContext {
    /// Applies transpose, octave shift, cent tuning and the tuning system to a MIDI note, in
    /// that order.
    pub fn tune(&self, note: f64) -> f64 {
        let shifted =
            note + self.transpose + 12.0 * f64::from(self.octave) + self.cent_tuning / 100.0;
        self.tuning.resolve(shifted)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// A thread running user code, as seen from other threads.
///
/// Killing is cooperative: a killed thread stops at its next sleep or trigger. A thread inside a
/// no-kill section finishes that section before a kill takes hold.
#[derive(Clone)]
pub struct ThreadHandle(Arc<ThreadInner>);

struct ThreadInner {
    id: u64,
    job_id: u64,
    name: String,
    finished: Promise<()>,
    subthreads: Mutex<Vec<ThreadHandle>>,
    no_kill: ReentrantMutex<()>,
    killed: AtomicBool,
    kill_switch: Mutex<Option<Sender<()>>>,
    cancelled: Receiver<()>,
}

impl ThreadHandle {
    pub(crate) fn new(job_id: u64, name: impl Into<String>) -> ThreadHandle {
        let (kill_switch, cancelled) = bounded(0);
        ThreadHandle(Arc::new(ThreadInner {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst),
            job_id,
            name: name.into(),
            finished: Promise::new(),
            subthreads: Mutex::new(Vec::new()),
            no_kill: ReentrantMutex::new(()),
            killed: AtomicBool::new(false),
            kill_switch: Mutex::new(Some(kill_switch)),
            cancelled,
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn job_id(&self) -> u64 {
        self.0.job_id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_finished(&self) -> bool {
        self.0.finished.is_delivered()
    }

    pub fn is_killed(&self) -> bool {
        self.0.killed.load(Ordering::SeqCst)
    }

    /// Kills this thread and every thread it started.
    pub fn kill(&self) {
        {
            let _no_kill = self.0.no_kill.lock();
            self.0.killed.store(true, Ordering::SeqCst);
            self.0.kill_switch.lock().take();
        }
        for subthread in self.subthreads() {
            subthread.kill();
        }
    }

    /// Blocks until the thread's code has returned.
    pub fn join(&self) {
        self.0.finished.get();
    }

    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.0.finished.get_timeout(timeout).is_some()
    }

    /// Blocks until this thread and everything it started, transitively, have finished.
    pub fn join_all(&self) {
        self.join();
        self.join_subthreads();
    }

    pub(crate) fn join_subthreads(&self) {
        for subthread in self.subthreads() {
            subthread.join_all();
        }
    }

    pub(crate) fn subthreads(&self) -> Vec<ThreadHandle> {
        self.0.subthreads.lock().clone()
    }

    /// Registers a new child thread. Finished children are forgotten.
    pub(crate) fn spawn_child(&self, name: impl Into<String>) -> ThreadHandle {
        let child = ThreadHandle::new(self.0.job_id, name);
        let mut subthreads = self.0.subthreads.lock();
        subthreads.retain(|thread| !thread.is_finished() || !thread.subthreads().is_empty());
        subthreads.push(child.clone());
        drop(subthreads);
        if self.is_killed() {
            child.kill();
        }
        child
    }

    pub(crate) fn no_kill(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.no_kill.lock()
    }

    /// Disconnects when the thread is killed.
    pub(crate) fn cancelled(&self) -> &Receiver<()> {
        &self.0.cancelled
    }

    /// Disconnects when the thread's code has returned.
    pub(crate) fn finished_signal(&self) -> &Receiver<()> {
        self.0.finished.signal()
    }

    pub(crate) fn finish(&self) {
        self.0.finished.deliver(());
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.0.id)
            .field("job_id", &self.0.job_id)
            .field("name", &self.0.name)
            .field("killed", &self.is_killed())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Where a thread's sounds are routed, and what they are tracked by.
#[derive(Debug, Clone, Default)]
pub(crate) struct Locals {
    /// Overrides the job's group, inside FX blocks.
    pub(crate) group: Option<Node>,
    /// Overrides the job's bus, inside FX blocks.
    pub(crate) out_bus: Option<i32>,
    pub(crate) fx_tracker: Option<SynthTracker>,
    pub(crate) tracker: SynthTracker,
    pub(crate) last_triggered: Option<SoundHandle>,
}

/// A thread's view of the runtime.
pub struct Context {
    runtime: Runtime,
    job_id: u64,
    thread: ThreadHandle,
    started: SystemTime,
    pub(crate) musical: MusicalContext,
    pub(crate) clock: LogicalClock,
    pub(crate) locals: Locals,
    delayed: Vec<(MessageKind, String)>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("job_id", &self.job_id)
            .field("thread", &self.thread)
            .field("musical", &self.musical)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Context {
    pub(crate) fn new(runtime: Runtime, job_id: u64, thread: ThreadHandle) -> Context {
        let clock = LogicalClock::new(
            Arc::clone(runtime.time_source()),
            runtime.config().sched_ahead(),
        );
        Context {
            job_id,
            thread,
            started: clock.logical_time(),
            musical: MusicalContext::default(),
            clock,
            locals: Locals::default(),
            delayed: Vec::new(),
            runtime,
        }
    }

    /// A copy of this context for a new thread. Pending messages stay with this thread.
    pub(crate) fn fork(&self, thread: ThreadHandle) -> Context {
        Context {
            runtime: self.runtime.clone(),
            job_id: self.job_id,
            thread,
            started: self.started,
            musical: self.musical.clone(),
            clock: self.clock.clone(),
            locals: Locals {
                tracker: SynthTracker::new(),
                ..self.locals.clone()
            },
            delayed: Vec::new(),
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn studio(&self) -> &Studio {
        self.runtime.studio()
    }

    pub fn musical(&self) -> &MusicalContext {
        &self.musical
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// The sound most recently triggered by this thread.
    pub fn last_triggered(&self) -> Option<&SoundHandle> {
        self.locals.last_triggered.as_ref()
    }

    /// Tunes a MIDI note with this thread's settings and the runtime's global cent tuning.
    pub fn tune_note(&self, note: f64) -> f64 {
        self.musical
            .tune(note + self.runtime.config().cent_tuning / 100.0)
    }

    /// The synths this thread has triggered that are still running.
    pub fn synth_tracker(&self) -> &SynthTracker {
        &self.locals.tracker
    }

    /// Fails with [`Error::Killed`] once the thread has been killed.
    pub fn check_killed(&self) -> Result<()> {
        if self.thread.is_killed() {
            return Err(Error::Killed);
        }
        Ok(())
    }

    /// Runs `f` without letting a kill interrupt it.
    pub fn no_kill<T, F>(&mut self, f: F) -> T
    where
        F: FnOnce(&mut Context) -> T,
    {
        let thread = self.thread.clone();
        let _no_kill = thread.no_kill();
        f(self)
    }

    /// The group new sounds are created in: the current FX block's, or the job's.
    pub fn current_group(&self) -> Result<Node> {
        match &self.locals.group {
            Some(group) => Ok(group.clone()),
            None => self.runtime.resources().job_group(self.job_id),
        }
    }

    /// The bus new sounds write to: the current FX block's, or the job's.
    pub fn current_out_bus(&self) -> Result<i32> {
        match self.locals.out_bus {
            Some(bus) => Ok(bus),
            None => Ok(self.runtime.resources().job_bus(self.job_id)?.to_i32()),
        }
    }

    //
    // ========== Time ==========
    //

    /// Advances logical time by `beats` and waits for the wall clock to catch up. Pending
    /// messages are sent first.
    pub fn sleep(&mut self, beats: f64) -> Result<()> {
        self.check_killed()?;
        self.flush_messages();
        if !self.clock.sleep(beats, self.thread.cancelled()) {
            return Err(Error::Killed);
        }
        self.check_killed()
    }

    /// Seconds of logical time since the job started.
    pub fn logical_elapsed(&self) -> f64 {
        self.clock
            .logical_time()
            .duration_since(self.started)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn current_bpm(&self) -> f64 {
        self.clock.bpm()
    }

    pub fn use_bpm(&mut self, bpm: f64) -> Result<()> {
        self.clock.set_bpm(bpm)
    }

    pub fn with_bpm<T, F>(&mut self, bpm: f64, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        let previous = self.clock.bpm();
        self.clock.set_bpm(bpm)?;
        let result = block(self);
        self.clock.set_bpm(previous)?;
        result
    }

    pub fn current_sched_ahead_time(&self) -> f64 {
        self.clock.sched_ahead().as_secs_f64()
    }

    /// Whether a trigger now should be skipped under timing guarantees.
    pub(crate) fn out_of_time(&self) -> bool {
        self.musical.timing_guarantees && self.clock.in_good_time() != Timeliness::OnTime
    }

    /// Fails once the thread is too far behind, unless timing warnings are off.
    pub(crate) fn ensure_good_timing(&self) -> Result<()> {
        if !self.musical.timing_warnings {
            return Ok(());
        }
        if self.clock.in_good_time() == Timeliness::Late {
            log::warn!(
                "job {} running {:.3}s behind",
                self.job_id,
                self.clock.time_diff()
            );
        }
        self.clock.ensure_good_timing()
    }

    //
    // ========== Messages ==========
    //

    /// Queues a line to be shown at the next sleep.
    pub fn message(&mut self, text: impl Into<String>) {
        self.delayed.push((MessageKind::Info, text.into()));
    }

    pub(crate) fn warning(&mut self, text: impl Into<String>) {
        self.delayed.push((MessageKind::Warning, text.into()));
    }

    pub(crate) fn serious_warning(&mut self, text: impl Into<String>) {
        self.delayed.push((MessageKind::SeriousWarning, text.into()));
    }

    /// Queues a trigger description, unless debug output is off.
    pub(crate) fn describe(&mut self, text: impl Into<String>) {
        if self.musical.debug {
            self.message(text);
        }
    }

    /// Sends the queued lines as one message stamped with the thread's logical time.
    pub fn flush_messages(&mut self) {
        if self.delayed.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.delayed);
        self.runtime.messages().push(OutboundMessage::MultiMessage {
            job_id: self.job_id,
            thread_name: self.thread.name().to_owned(),
            logical_time: self.logical_elapsed(),
            lines,
        });
    }

    //
    // ========== Threads ==========
    //

    /// Runs `f` on a new thread with a copy of this context.
    pub fn in_thread<F>(&mut self, name: Option<&str>, f: F) -> Result<ThreadHandle>
    where
        F: FnOnce(&mut Context) -> Result<()> + Send + 'static,
    {
        self.check_killed()?;
        let thread = self.thread.spawn_child(name.unwrap_or_default());
        let child = self.fork(thread.clone());
        self.runtime.spawn_thread(child, f)?;
        Ok(thread)
    }

    //
    // ========== Musical settings ==========
    //

    fn with_setting<V, T, F>(
        &mut self,
        field: fn(&mut MusicalContext) -> &mut V,
        value: V,
        block: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        let previous = std::mem::replace(field(&mut self.musical), value);
        let result = block(self);
        *field(&mut self.musical) = previous;
        result
    }

    fn check_synth_name(&self, name: &str) -> Result<()> {
        let known = SynthInfo::get(name).map_or(false, |info| info.kind == SynthKind::Synth);
        if known || self.musical.external_synths {
            Ok(())
        } else {
            Err(Error::UnknownSynth(name.to_owned()))
        }
    }

    pub fn use_synth(&mut self, name: &str) -> Result<()> {
        self.check_synth_name(name)?;
        self.musical.synth = name.to_owned();
        Ok(())
    }

    pub fn with_synth<T, F>(&mut self, name: &str, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.check_synth_name(name)?;
        self.with_setting(|m| &mut m.synth, name.to_owned(), block)
    }

    pub fn current_synth(&self) -> &str {
        &self.musical.synth
    }

    /// Replaces the synth defaults.
    pub fn use_synth_defaults(&mut self, args: Args) {
        self.musical.synth_defaults = args;
    }

    /// Adds to the synth defaults, overriding any already set.
    pub fn use_merged_synth_defaults(&mut self, args: Args) {
        self.musical.synth_defaults = self.musical.synth_defaults.merged(&args);
    }

    pub fn with_synth_defaults<T, F>(&mut self, args: Args, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.synth_defaults, args, block)
    }

    pub fn with_merged_synth_defaults<T, F>(&mut self, args: Args, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        let merged = self.musical.synth_defaults.merged(&args);
        self.with_setting(|m| &mut m.synth_defaults, merged, block)
    }

    pub fn current_synth_defaults(&self) -> &Args {
        &self.musical.synth_defaults
    }

    pub fn use_sample_defaults(&mut self, args: Args) {
        self.musical.sample_defaults = args;
    }

    pub fn use_merged_sample_defaults(&mut self, args: Args) {
        self.musical.sample_defaults = self.musical.sample_defaults.merged(&args);
    }

    pub fn with_sample_defaults<T, F>(&mut self, args: Args, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.sample_defaults, args, block)
    }

    pub fn with_merged_sample_defaults<T, F>(&mut self, args: Args, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        let merged = self.musical.sample_defaults.merged(&args);
        self.with_setting(|m| &mut m.sample_defaults, merged, block)
    }

    pub fn current_sample_defaults(&self) -> &Args {
        &self.musical.sample_defaults
    }

    pub fn use_transpose(&mut self, semitones: f64) {
        self.musical.transpose = semitones;
    }

    pub fn with_transpose<T, F>(&mut self, semitones: f64, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.transpose, semitones, block)
    }

    pub fn current_transpose(&self) -> f64 {
        self.musical.transpose
    }

    pub fn use_octave(&mut self, shift: i32) {
        self.musical.octave = shift;
    }

    pub fn with_octave<T, F>(&mut self, shift: i32, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.octave, shift, block)
    }

    pub fn current_octave(&self) -> i32 {
        self.musical.octave
    }

    pub fn use_cent_tuning(&mut self, cents: f64) {
        self.musical.cent_tuning = cents;
    }

    pub fn with_cent_tuning<T, F>(&mut self, cents: f64, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.cent_tuning, cents, block)
    }

    pub fn current_cent_tuning(&self) -> f64 {
        self.musical.cent_tuning
    }

    fn tuning_for(system: TuningSystem, fundamental: &Value) -> Result<Tuning> {
        let fundamental = note::note(fundamental)?.ok_or_else(|| {
            Error::invalid(format!("tuning fundamental must be a note, got {}", fundamental))
        })?;
        Ok(Tuning::new(system, fundamental))
    }

    pub fn use_tuning(
        &mut self,
        system: TuningSystem,
        fundamental: impl Into<Value>,
    ) -> Result<()> {
        self.musical.tuning = Self::tuning_for(system, &fundamental.into())?;
        Ok(())
    }

    pub fn with_tuning<T, F>(
        &mut self,
        system: TuningSystem,
        fundamental: impl Into<Value>,
        block: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        let tuning = Self::tuning_for(system, &fundamental.into())?;
        self.with_setting(|m| &mut m.tuning, tuning, block)
    }

    pub fn current_tuning(&self) -> Tuning {
        self.musical.tuning
    }

    pub fn use_timing_guarantees(&mut self, enabled: bool) {
        self.musical.timing_guarantees = enabled;
    }

    pub fn with_timing_guarantees<T, F>(&mut self, enabled: bool, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.timing_guarantees, enabled, block)
    }

    pub fn current_timing_guarantees(&self) -> bool {
        self.musical.timing_guarantees
    }

    pub fn use_timing_warnings(&mut self, enabled: bool) {
        self.musical.timing_warnings = enabled;
    }

    pub fn with_timing_warnings<T, F>(&mut self, enabled: bool, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.timing_warnings, enabled, block)
    }

    pub fn current_timing_warnings(&self) -> bool {
        self.musical.timing_warnings
    }

    pub fn use_arg_checks(&mut self, enabled: bool) {
        self.musical.arg_checks = enabled;
    }

    pub fn with_arg_checks<T, F>(&mut self, enabled: bool, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.arg_checks, enabled, block)
    }

    pub fn current_arg_checks(&self) -> bool {
        self.musical.arg_checks
    }

    pub fn use_debug(&mut self, enabled: bool) {
        self.musical.debug = enabled;
    }

    pub fn with_debug<T, F>(&mut self, enabled: bool, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.debug, enabled, block)
    }

    pub fn current_debug(&self) -> bool {
        self.musical.debug
    }

    pub fn use_external_synths(&mut self, enabled: bool) {
        self.musical.external_synths = enabled;
    }

    pub fn with_external_synths<T, F>(&mut self, enabled: bool, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.external_synths, enabled, block)
    }

    pub fn current_external_synths(&self) -> bool {
        self.musical.external_synths
    }

    pub fn use_arg_bpm_scaling(&mut self, enabled: bool) {
        self.musical.arg_bpm_scaling = enabled;
    }

    pub fn with_arg_bpm_scaling<T, F>(&mut self, enabled: bool, block: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        self.with_setting(|m| &mut m.arg_bpm_scaling, enabled, block)
    }

    pub fn current_arg_bpm_scaling(&self) -> bool {
        self.musical.arg_bpm_scaling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn tuning_applies_shifts_in_order() {
        let mut musical = MusicalContext::default();
        musical.transpose = 1.0;
        assert_eq!(musical.tune(50.0), 51.0);

        let mut musical = MusicalContext::default();
        musical.octave = 1;
        assert_eq!(musical.tune(50.0), 62.0);

        let mut musical = MusicalContext::default();
        musical.transpose = -2.0;
        musical.octave = -1;
        musical.cent_tuning = 50.0;
        assert_eq!(musical.tune(60.0), 46.5);
    }

    #[test]
    fn defaults_match_a_fresh_thread() {
        let musical = MusicalContext::default();
        assert_eq!(musical.synth, "beep");
        assert!(musical.timing_warnings && musical.arg_checks && musical.debug);
        assert!(!musical.timing_guarantees && !musical.external_synths);
        assert_eq!(musical.synth_defaults, args! {});
    }

    #[test]
    fn killing_waits_for_no_kill_sections() {
        let thread = ThreadHandle::new(1, "");
        let guard = thread.no_kill();
        let killer = {
            let thread = thread.clone();
            std::thread::spawn(move || thread.kill())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!thread.is_killed());
        drop(guard);
        killer.join().unwrap();
        assert!(thread.is_killed());
        assert!(thread.cancelled().recv().is_err());
    }

    #[test]
    fn kills_reach_subthreads() {
        let parent = ThreadHandle::new(1, "");
        let child = parent.spawn_child("child");
        let grandchild = child.spawn_child("");
        parent.kill();
        assert!(child.is_killed());
        assert!(grandchild.is_killed());
        // Children started after a kill are born killed.
        assert!(parent.spawn_child("late").is_killed());
    }

    #[test]
    fn join_all_waits_for_descendants() {
        let parent = ThreadHandle::new(1, "");
        let child = parent.spawn_child("");
        parent.finish();
        assert!(parent.join_timeout(Duration::from_millis(10)));
        let (done_tx, done_rx) = bounded(1);
        let waiter = {
            let parent = parent.clone();
            std::thread::spawn(move || {
                parent.join_all();
                done_tx.send(()).unwrap();
            })
        };
        assert!(done_rx.recv_timeout(Duration::from_millis(20)).is_err());
        child.finish();
        waiter.join().unwrap();
        assert!(done_rx.try_recv().is_ok());
    }
}
