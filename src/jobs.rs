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

//! The registry of running jobs and the engine resources each one owns.
//!
//! A job is one run of user code. Its synths live in a group of their own and play into a bus of
//! their own, which a per-job mixer synth copies to the main mixer. All three are created on
//! first use. When the job ends they are torn down in order: the mixer fades out and is freed,
//! then the group is freed, then the bus is returned.

use crate::{
    args,
    bus::AudioBus,
    clock::TimeSource,
    context::ThreadHandle,
    error::Result,
    node::Node,
    studio::{Position, Studio, Timing},
    synth_info::SynthInfo,
};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

/// A change in the life of the runtime's jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeEvent {
    Init(u64),
    Killed(u64),
    Completed(u64),
    /// The last running job has ended.
    AllCompleted,
    Exit,
}

type Hook = Box<dyn Fn(LifeEvent) + Send + Sync>;

/// Callbacks run on every [`LifeEvent`], on the thread the event happened on.
#[derive(Default)]
pub struct LifeHooks(RwLock<Vec<Hook>>);

impl LifeHooks {
    pub fn subscribe<F>(&self, hook: F)
    where
        F: Fn(LifeEvent) + Send + Sync + 'static,
    {
        self.0.write().push(Box::new(hook));
    }

    pub(crate) fn fire(&self, event: LifeEvent) {
        log::debug!("life event {:?}", event);
        for hook in self.0.read().iter() {
            hook(event);
        }
    }
}

impl fmt::Debug for LifeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LifeHooks({})", self.0.read().len())
    }
}

#[derive(Debug, Clone)]
struct JobEntry {
    thread: ThreadHandle,
    started: SystemTime,
}

/// The jobs currently running.
pub struct Jobs {
    next_id: AtomicU64,
    jobs: ArcSwap<HashMap<u64, JobEntry>>,
}

impl Default for Jobs {
    fn default() -> Jobs {
        Jobs {
            next_id: AtomicU64::new(0),
            jobs: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl fmt::Debug for Jobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jobs").field("running", &self.running()).finish()
    }
}

impl Jobs {
    pub fn new() -> Jobs {
        Jobs::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn add_job(&self, id: u64, thread: ThreadHandle, started: SystemTime) {
        self.jobs.rcu(|jobs| {
            let mut jobs = HashMap::clone(jobs);
            jobs.insert(
                id,
                JobEntry {
                    thread: thread.clone(),
                    started,
                },
            );
            jobs
        });
    }

    /// Forgets a job. Returns whether it was registered.
    pub(crate) fn job_completed(&self, id: u64) -> bool {
        let previous = self.jobs.rcu(|jobs| {
            let mut jobs = HashMap::clone(jobs);
            jobs.remove(&id);
            jobs
        });
        previous.contains_key(&id)
    }

    /// Kills a job's threads. Returns whether the job was running.
    pub fn kill_job(&self, id: u64) -> bool {
        match self.thread(id) {
            Some(thread) => {
                log::info!("killing job {}", id);
                thread.kill();
                true
            }
            None => false,
        }
    }

    /// The ids of the running jobs, oldest first.
    pub fn running(&self) -> Vec<u64> {
        let jobs = self.jobs.load();
        let mut ids: Vec<(SystemTime, u64)> =
            jobs.iter().map(|(id, entry)| (entry.started, *id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn each_id<F: FnMut(u64)>(&self, f: F) {
        self.running().into_iter().for_each(f)
    }

    pub fn any_jobs_running(&self) -> bool {
        !self.jobs.load().is_empty()
    }

    pub fn thread(&self, id: u64) -> Option<ThreadHandle> {
        self.jobs.load().get(&id).map(|entry| entry.thread.clone())
    }
}

/// The group, bus and mixer of each job, created on demand.
pub struct JobResources {
    studio: Studio,
    time: Arc<dyn TimeSource>,
    fade: Duration,
    groups: ArcSwap<HashMap<u64, Node>>,
    groups_lock: Mutex<()>,
    busses: ArcSwap<HashMap<u64, AudioBus>>,
    busses_lock: Mutex<()>,
    mixers: ArcSwap<HashMap<u64, Node>>,
    mixers_lock: Mutex<()>,
}

impl fmt::Debug for JobResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobResources")
            .field("groups", &self.groups.load())
            .field("busses", &self.busses.load())
            .field("mixers", &self.mixers.load())
            .finish()
    }
}

fn insert_entry<V: Clone>(map: &ArcSwap<HashMap<u64, V>>, id: u64, value: V) {
    map.rcu(|entries| {
        let mut entries = HashMap::clone(entries);
        entries.insert(id, value.clone());
        entries
    });
}

fn take_entry<V: Clone>(map: &ArcSwap<HashMap<u64, V>>, id: u64) -> Option<V> {
    let previous = map.rcu(|entries| {
        let mut entries = HashMap::clone(entries);
        entries.remove(&id);
        entries
    });
    previous.get(&id).cloned()
}

impl JobResources {
    pub(crate) fn new(studio: Studio, time: Arc<dyn TimeSource>) -> JobResources {
        let fade = Duration::from_secs_f64(studio.config().job_fade_out);
        JobResources {
            studio,
            time,
            fade,
            groups: ArcSwap::from_pointee(HashMap::new()),
            groups_lock: Mutex::new(()),
            busses: ArcSwap::from_pointee(HashMap::new()),
            busses_lock: Mutex::new(()),
            mixers: ArcSwap::from_pointee(HashMap::new()),
            mixers_lock: Mutex::new(()),
        }
    }

    /// The group a job's synths are created in.
    pub fn job_group(&self, id: u64) -> Result<Node> {
        if let Some(group) = self.groups.load().get(&id) {
            return Ok(group.clone());
        }
        let _lock = self.groups_lock.lock();
        if let Some(group) = self.groups.load().get(&id) {
            return Ok(group.clone());
        }
        let group = self.studio.new_synth_group(id)?;
        insert_entry(&self.groups, id, group.clone());
        Ok(group)
    }

    /// The bus a job's synths play into. The job's mixer is started with it.
    pub fn job_bus(&self, id: u64) -> Result<AudioBus> {
        let bus = {
            if let Some(bus) = self.busses.load().get(&id) {
                return Ok(bus.clone());
            }
            let _lock = self.busses_lock.lock();
            match self.busses.load().get(&id) {
                Some(bus) => bus.clone(),
                None => {
                    let bus = self.studio.new_fx_bus().map_err(|err| {
                        log::error!("All busses allocated - unable to create audio bus for job");
                        err
                    })?;
                    insert_entry(&self.busses, id, bus.clone());
                    bus
                }
            }
        };
        self.ensure_mixer(id, &bus)?;
        Ok(bus)
    }

    /// The synth copying a job's bus to the main mixer.
    pub fn job_mixer(&self, id: u64) -> Result<Node> {
        let bus = self.job_bus(id)?;
        self.ensure_mixer(id, &bus)
    }

    fn ensure_mixer(&self, id: u64, bus: &AudioBus) -> Result<Node> {
        if let Some(mixer) = self.mixers.load().get(&id) {
            return Ok(mixer.clone());
        }
        let _lock = self.mixers_lock.lock();
        if let Some(mixer) = self.mixers.load().get(&id) {
            return Ok(mixer.clone());
        }
        let info = SynthInfo::get("basic_mixer");
        let mut args = args! {in_bus: bus.to_i32(), amp: 0.3, out_bus: self.studio.mixer_bus()};
        if let Some(info) = info {
            args.merge_defaults(&info.arg_defaults());
            info.validate(&args)?;
        }
        let mixer = self.studio.trigger_synth(
            "sonic-pi-basic_mixer",
            &self.studio.mixer_group(),
            &args,
            info,
            Timing::Now,
            Position::Head,
        )?;
        insert_entry(&self.mixers, id, mixer.clone());
        Ok(mixer)
    }

    /// Fades out and frees a job's mixer, then frees its group and its bus. Failures are logged.
    pub(crate) fn shutdown_job(&self, id: u64) {
        let mixer = {
            let _lock = self.mixers_lock.lock();
            take_entry(&self.mixers, id)
        };
        if let Some(mixer) = mixer {
            let fade = self.fade.as_secs_f64();
            let fade_args = args! {amp: 0, amp_slide: fade};
            if let Err(err) = self.studio.control(&mixer, &fade_args, Timing::Now) {
                log::error!("failed to fade out mixer of job {}: {}", id, err);
            }
            let deadline = self.time.now() + self.fade;
            self.time.wait_until(deadline, &crossbeam_channel::never());
            if let Err(err) = self.studio.kill(&mixer, Timing::Now) {
                log::error!("failed to free mixer of job {}: {}", id, err);
            }
        }

        let group = {
            let _lock = self.groups_lock.lock();
            take_entry(&self.groups, id)
        };
        if let Some(group) = group {
            if let Err(err) = self.studio.kill(&group, Timing::Now) {
                log::error!("failed to free group of job {}: {}", id, err);
            }
        }

        let bus = {
            let _lock = self.busses_lock.lock();
            take_entry(&self.busses, id)
        };
        if let Some(bus) = bus {
            bus.free();
        }
    }

    pub fn has_resources(&self, id: u64) -> bool {
        self.groups.load().contains_key(&id)
            || self.busses.load().contains_key(&id)
            || self.mixers.load().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn jobs_are_listed_oldest_first() {
        let jobs = Jobs::new();
        let start = SystemTime::UNIX_EPOCH;
        let a = jobs.next_id();
        let b = jobs.next_id();
        assert_ne!(a, b);
        jobs.add_job(b, ThreadHandle::new(b, "b"), start + Duration::from_secs(2));
        jobs.add_job(a, ThreadHandle::new(a, "a"), start + Duration::from_secs(1));
        assert_eq!(jobs.running(), vec![a, b]);
        assert!(jobs.any_jobs_running());

        assert!(jobs.job_completed(a));
        assert!(!jobs.job_completed(a));
        assert_eq!(jobs.running(), vec![b]);
    }

    #[test]
    fn killing_a_job_kills_its_thread() {
        let jobs = Jobs::new();
        let thread = ThreadHandle::new(7, "job-7");
        jobs.add_job(7, thread.clone(), SystemTime::now());
        assert!(jobs.kill_job(7));
        assert!(thread.is_killed());
        assert!(!jobs.kill_job(8));
    }

    #[test]
    fn hooks_see_every_event() {
        let hooks = LifeHooks::default();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            hooks.subscribe(move |event| {
                if let LifeEvent::Completed(3) = event {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        hooks.fire(LifeEvent::Init(3));
        hooks.fire(LifeEvent::Completed(3));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
