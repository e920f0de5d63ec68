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

//! The runtime: jobs, their threads, and everything they share.
//!
//! ```no_run
//! use sonance::{args, config::RuntimeConfig, messages::JsonLinesSink, server::Server, Runtime};
//! use std::{io, sync::Arc};
//!
//! let config = RuntimeConfig::default();
//! let server = Server::connect(&config.scsynth_address)?;
//! let runtime = Runtime::new(Arc::new(server), config, JsonLinesSink::new(io::stdout()))?;
//! let job = runtime.run_job(|ctx| {
//!     ctx.use_synth("saw")?;
//!     for note in [60, 64, 67].iter() {
//!         ctx.play(*note, args! {release: 0.5})?;
//!         ctx.sleep(0.5)?;
//!     }
//!     Ok(())
//! })?;
//! job.join();
//! runtime.shutdown()?;
//! # Ok::<(), sonance::Error>(())
//! ```

use crate::{
    clock::{SystemClock, TimeSource},
    config::RuntimeConfig,
    context::{Context, ThreadHandle},
    error::{Error, Result},
    jobs::{JobResources, Jobs, LifeEvent, LifeHooks},
    messages::{GuiSink, JobAction, MessageQueue, OutboundMessage, Relay},
    promise::Promise,
    sampler::SampleIndex,
    server::Transport,
    studio::Studio,
};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// A running job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    thread: ThreadHandle,
    done: Promise<()>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    /// Whether the job has finished and its resources have been released.
    pub fn is_done(&self) -> bool {
        self.done.is_delivered()
    }

    pub fn join(&self) {
        self.done.get();
    }

    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.done.get_timeout(timeout).is_some()
    }
}

struct HealthCheck {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct RuntimeInner {
    studio: Studio,
    config: RuntimeConfig,
    time: Arc<dyn TimeSource>,
    messages: MessageQueue,
    jobs: Jobs,
    resources: JobResources,
    hooks: LifeHooks,
    samples: SampleIndex,
    relay: Mutex<Option<Relay>>,
    health: Mutex<Option<HealthCheck>>,
}

/// Runs jobs against an audio engine. Clones share one runtime.
#[derive(Clone)]
pub struct Runtime(Arc<RuntimeInner>);

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("jobs", &self.0.jobs)
            .finish()
    }
}

impl Runtime {
    /// Starts a runtime on the system clock, sending GUI messages to `sink`.
    pub fn new<S>(transport: Arc<dyn Transport>, config: RuntimeConfig, sink: S) -> Result<Runtime>
    where
        S: GuiSink + Send + 'static,
    {
        Runtime::with_time_source(transport, config, sink, Arc::new(SystemClock))
    }

    pub fn with_time_source<S>(
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
        sink: S,
        time: Arc<dyn TimeSource>,
    ) -> Result<Runtime>
    where
        S: GuiSink + Send + 'static,
    {
        let studio = Studio::new(transport, config.clone())?;
        let (messages, queued) = MessageQueue::new();
        let relay = Relay::spawn(queued, sink)?;
        let runtime = Runtime(Arc::new(RuntimeInner {
            resources: JobResources::new(studio.clone(), Arc::clone(&time)),
            samples: SampleIndex::new(config.samples_path.clone()),
            studio,
            config,
            time,
            messages,
            jobs: Jobs::new(),
            hooks: LifeHooks::default(),
            relay: Mutex::new(Some(relay)),
            health: Mutex::new(None),
        }));
        runtime.messages().push(OutboundMessage::Version {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            platform: std::env::consts::OS.to_owned(),
        });
        runtime.start_health_checks()?;
        log::info!("runtime started");
        Ok(runtime)
    }

    fn start_health_checks(&self) -> Result<()> {
        let period = self.0.config.health_check_period();
        if period == Duration::from_secs(0) {
            return Ok(());
        }
        let (stop, stopped) = bounded::<()>(0);
        let runtime = Arc::downgrade(&self.0);
        let handle = thread::Builder::new()
            .name("health-check".to_owned())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let runtime = match runtime.upgrade() {
                    Some(inner) => Runtime(inner),
                    None => break,
                };
                if runtime.studio().error_occurred() {
                    log::error!("audio engine stopped responding, stopping all jobs");
                    runtime.messages().push(OutboundMessage::Error {
                        job_id: 0,
                        description: "The audio engine stopped responding".to_owned(),
                        backtrace: String::new(),
                        line: -1,
                    });
                    runtime.stop_all_jobs();
                }
            })
            .map_err(Error::Spawn)?;
        *self.0.health.lock() = Some(HealthCheck { stop, handle });
        Ok(())
    }

    pub fn studio(&self) -> &Studio {
        &self.0.studio
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.0.config
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.0.time
    }

    pub fn messages(&self) -> &MessageQueue {
        &self.0.messages
    }

    pub fn jobs(&self) -> &Jobs {
        &self.0.jobs
    }

    pub fn resources(&self) -> &JobResources {
        &self.0.resources
    }

    pub fn hooks(&self) -> &LifeHooks {
        &self.0.hooks
    }

    pub fn samples(&self) -> &SampleIndex {
        &self.0.samples
    }

    //
    // ========== Jobs ==========
    //

    fn register_job(&self) -> (u64, ThreadHandle) {
        let id = self.0.jobs.next_id();
        let thread = ThreadHandle::new(id, format!("job-{}", id));
        self.0.jobs.add_job(id, thread.clone(), self.0.time.now());
        (id, thread)
    }

    /// Runs `code` as a new job on a thread of its own.
    pub fn run_job<F>(&self, code: F) -> Result<JobHandle>
    where
        F: FnOnce(&mut Context) -> Result<()> + Send + 'static,
    {
        let (id, thread) = self.register_job();
        let done = Promise::new();
        let job = JobHandle {
            id,
            thread: thread.clone(),
            done: done.clone(),
        };
        let runtime = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", id))
            .spawn(move || {
                // Panics have been reported by now.
                let _ = runtime.execute_job(id, thread, code);
                done.deliver(());
            });
        if let Err(err) = spawned {
            self.0.jobs.job_completed(id);
            job.thread.finish();
            job.done.deliver(());
            return Err(Error::Spawn(err));
        }
        Ok(job)
    }

    /// Runs `code` as a new job on the calling thread, returning what it returns once the job
    /// has been cleaned up. A panic in `code` is resumed after cleanup.
    pub fn run_job_inline<T, F>(&self, code: F) -> Result<T>
    where
        F: FnOnce(&mut Context) -> Result<T>,
    {
        let (id, thread) = self.register_job();
        let mut output = None;
        let outcome = self.execute_job(id, thread, |ctx| {
            output = Some(code(ctx)?);
            Ok(())
        });
        match outcome {
            Ok(Ok(())) => output.ok_or_else(|| Error::invalid("job produced no result")),
            Ok(Err(err)) => Err(err),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn execute_job<F>(
        &self,
        id: u64,
        thread: ThreadHandle,
        code: F,
    ) -> thread::Result<Result<()>>
    where
        F: FnOnce(&mut Context) -> Result<()>,
    {
        log::debug!("starting job {}", id);
        if let Err(err) = self.0.studio.start() {
            log::error!("failed to resume the mixer for job {}: {}", id, err);
        }
        self.0.hooks.fire(LifeEvent::Init(id));
        self.0.messages.push(OutboundMessage::Job {
            job_id: id,
            action: JobAction::Started,
        });

        let mut ctx = Context::new(self.clone(), id, thread.clone());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| code(&mut ctx)));
        ctx.flush_messages();
        match &outcome {
            Ok(result) => self.report(id, result),
            Err(payload) => {
                let panicked = Err(Error::Panicked(panic_message(payload.as_ref())));
                self.report(id, &panicked);
            }
        }

        thread.join_subthreads();
        thread.finish();
        self.finish_job(id, &thread);
        outcome
    }

    /// Shows an error that ended a thread. Killed threads are not errors.
    fn report(&self, job_id: u64, result: &Result<()>) {
        let err = match result {
            Err(err) if !err.is_killed() => err,
            _ => return,
        };
        log::error!("job {} failed: {}", job_id, err);
        self.0.messages.push(OutboundMessage::Error {
            job_id,
            description: err.to_string(),
            backtrace: error_chain(err),
            line: -1,
        });
    }

    fn finish_job(&self, id: u64, thread: &ThreadHandle) {
        self.0.jobs.job_completed(id);
        let (event, action) = if thread.is_killed() {
            (LifeEvent::Killed(id), JobAction::Killed)
        } else {
            (LifeEvent::Completed(id), JobAction::Completed)
        };
        self.0.hooks.fire(event);
        self.0.messages.push(OutboundMessage::Job { job_id: id, action });
        self.0.resources.shutdown_job(id);
        log::debug!("job {} finished", id);
        if !self.0.jobs.any_jobs_running() {
            if let Err(err) = self.0.studio.pause() {
                log::error!("failed to pause the mixer: {}", err);
            }
            self.0.hooks.fire(LifeEvent::AllCompleted);
            self.0.messages.push(OutboundMessage::AllJobsCompleted);
        }
    }

    /// Runs a thread started with [`Context::in_thread`].
    pub(crate) fn spawn_thread<F>(&self, mut ctx: Context, f: F) -> Result<()>
    where
        F: FnOnce(&mut Context) -> Result<()> + Send + 'static,
    {
        let handle = ctx.thread().clone();
        let name = if handle.name().is_empty() {
            format!("job-{}-thread-{}", ctx.job_id(), handle.id())
        } else {
            handle.name().to_owned()
        };
        let runtime = self.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut ctx)));
            ctx.flush_messages();
            let result = outcome
                .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload.as_ref()))));
            runtime.report(ctx.job_id(), &result);
            ctx.thread().join_subthreads();
            ctx.thread().finish();
        });
        if let Err(err) = spawned {
            handle.finish();
            return Err(Error::Spawn(err));
        }
        Ok(())
    }

    /// Kills a job. It stops at its next sleep or trigger. Returns whether it was running.
    pub fn stop_job(&self, id: u64) -> bool {
        self.0.jobs.kill_job(id)
    }

    pub fn stop_all_jobs(&self) {
        self.0.jobs.each_id(|id| {
            self.0.jobs.kill_job(id);
        });
    }

    fn wait_for_jobs(&self) {
        let wait = self.0.config.reply_wait() + self.0.config.sched_ahead();
        for id in self.0.jobs.running() {
            if let Some(thread) = self.0.jobs.thread(id) {
                if !thread.join_timeout(wait) {
                    log::warn!("job {} did not stop in time", id);
                }
            }
        }
    }

    /// Stops every job and resets the engine.
    pub fn reboot(&self) -> Result<()> {
        log::info!("rebooting");
        self.stop_all_jobs();
        self.wait_for_jobs();
        self.0.studio.reboot()
    }

    /// Stops every job, frees every node and flushes the remaining messages.
    pub fn shutdown(&self) -> Result<()> {
        log::info!("shutting down");
        let health = self.0.health.lock().take();
        if let Some(health) = health {
            drop(health.stop);
            if health.handle.join().is_err() {
                log::error!("health check thread panicked");
            }
        }
        self.stop_all_jobs();
        self.wait_for_jobs();
        let cleared = self.0.studio.clear();
        self.0.hooks.fire(LifeEvent::Exit);
        self.0.messages.push(OutboundMessage::Exit);
        let relay = self.0.relay.lock().take();
        if let Some(relay) = relay {
            relay.join();
        }
        cleared
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn error_chain(err: &Error) -> String {
    let mut lines = Vec::new();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        lines.push(cause.to_string());
        source = cause.source();
    }
    lines.join("\n")
}
