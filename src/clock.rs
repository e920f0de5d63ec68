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

//! Logical time.
//!
//! Every thread of a job keeps its own logical clock. The clock only advances when the thread
//! sleeps, and it advances by exactly the slept amount, so sounds triggered by a thread are
//! stamped at musically exact times regardless of how long the code between sleeps took to run.
//! Triggers are stamped `sched_ahead` after the logical time, giving the engine room to receive
//! them before they are due.
//!
//! Whether a thread is keeping up is measured by comparing its logical time with the wall clock:
//!
//! ```text
//! time_diff = (now - sched_ahead) - logical_time
//! ```
//!
//! A negative difference means the thread is ahead of time.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// A source of wall-clock time that threads can wait on.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> SystemTime;

    /// Blocks until `deadline`, or until `cancel` disconnects. Returns false when cancelled.
    fn wait_until(&self, deadline: SystemTime, cancel: &Receiver<()>) -> bool;
}

/// The system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn wait_until(&self, deadline: SystemTime, cancel: &Receiver<()>) -> bool {
        loop {
            let remaining = deadline.duration_since(SystemTime::now()).unwrap_or_default();
            if remaining == Duration::from_secs(0) {
                return !matches!(cancel.try_recv(), Err(TryRecvError::Disconnected));
            }
            match cancel.recv_timeout(remaining) {
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
                Ok(()) => {}
            }
        }
    }
}

/// A clock that only moves when told to.
///
/// Waiting on a manual clock returns at once and moves the clock forward to the deadline, as if
/// the waiting thread had slept exactly on time.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<SystemTime>>);

impl ManualClock {
    pub fn new(start: SystemTime) -> ManualClock {
        ManualClock(Arc::new(Mutex::new(start)))
    }

    pub fn set(&self, time: SystemTime) {
        *self.0.lock() = time;
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> ManualClock {
        ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000))
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> SystemTime {
        *self.0.lock()
    }

    fn wait_until(&self, deadline: SystemTime, cancel: &Receiver<()>) -> bool {
        if let Err(TryRecvError::Disconnected) = cancel.try_recv() {
            return false;
        }
        let mut now = self.0.lock();
        if *now < deadline {
            *now = deadline;
        }
        true
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManualClock").field(&*self.0.lock()).finish()
    }
}

/// How far behind its logical time a thread is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeliness {
    OnTime,
    /// Behind, but by less than 1.1 seconds.
    Late,
    /// 1.1 seconds or more behind.
    TooLate,
}

/// A thread's logical clock.
#[derive(Clone)]
pub struct LogicalClock {
    source: Arc<dyn TimeSource>,
    time: SystemTime,
    sched_ahead: Duration,
    bpm: f64,
}

impl LogicalClock {
    /// A clock starting at the source's current time, at 60 BPM.
    pub fn new(source: Arc<dyn TimeSource>, sched_ahead: Duration) -> LogicalClock {
        let time = source.now();
        LogicalClock {
            source,
            time,
            sched_ahead,
            bpm: 60.0,
        }
    }

    pub fn source(&self) -> &Arc<dyn TimeSource> {
        &self.source
    }

    pub fn logical_time(&self) -> SystemTime {
        self.time
    }

    /// The time at which sounds triggered now are due.
    pub fn sched_time(&self) -> SystemTime {
        self.time + self.sched_ahead
    }

    pub fn sched_ahead(&self) -> Duration {
        self.sched_ahead
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(Error::invalid(format!("BPM must be a positive number, got {}", bpm)));
        }
        self.bpm = bpm;
        Ok(())
    }

    /// Seconds per beat.
    pub fn sleep_mul(&self) -> f64 {
        60.0 / self.bpm
    }

    pub fn beats_to_duration(&self, beats: f64) -> Duration {
        Duration::from_secs_f64((beats * self.sleep_mul()).max(0.0))
    }

    /// Moves logical time forward without waiting.
    pub fn advance(&mut self, beats: f64) {
        self.time += self.beats_to_duration(beats);
    }

    /// Moves logical time forward and waits for the wall clock to catch up. Returns false if the
    /// wait was cancelled.
    pub fn sleep(&mut self, beats: f64, cancel: &Receiver<()>) -> bool {
        self.advance(beats);
        self.source.wait_until(self.time, cancel)
    }

    /// Seconds this thread is behind its logical time. Negative when ahead.
    pub fn time_diff(&self) -> f64 {
        let compensated = self.source.now() - self.sched_ahead;
        signed_seconds_between(compensated, self.time)
    }

    pub fn in_good_time(&self) -> Timeliness {
        let diff = self.time_diff();
        if diff < 0.0 {
            Timeliness::OnTime
        } else if diff < 1.1 {
            Timeliness::Late
        } else {
            Timeliness::TooLate
        }
    }

    /// Fails once the thread has fallen more than 1.1 seconds behind.
    pub fn ensure_good_timing(&self) -> Result<()> {
        if self.time_diff() > 1.1 {
            return Err(Error::Timing);
        }
        Ok(())
    }
}

impl fmt::Debug for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalClock")
            .field("time", &self.time)
            .field("sched_ahead", &self.sched_ahead)
            .field("bpm", &self.bpm)
            .finish()
    }
}

fn signed_seconds_between(a: SystemTime, b: SystemTime) -> f64 {
    match a.duration_since(b) {
        Ok(later) => later.as_secs_f64(),
        Err(earlier) => -earlier.duration().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Sender};

    fn clock() -> (ManualClock, LogicalClock) {
        let manual = ManualClock::default();
        let logical = LogicalClock::new(Arc::new(manual.clone()), Duration::from_millis(500));
        (manual, logical)
    }

    fn cancel() -> (Sender<()>, Receiver<()>) {
        bounded(0)
    }

    #[test]
    fn sleeping_scales_with_bpm() {
        let (_manual, mut clock) = clock();
        let start = clock.logical_time();
        let (_keep, cancel) = cancel();

        clock.set_bpm(120.0).unwrap();
        assert!(clock.sleep(1.0, &cancel));
        assert_eq!(clock.logical_time(), start + Duration::from_millis(500));
        assert!(clock.set_bpm(0.0).is_err());
    }

    #[test]
    fn timeliness() {
        let (manual, clock) = clock();
        assert_eq!(clock.in_good_time(), Timeliness::OnTime);
        assert!((clock.time_diff() + 0.5).abs() < 1e-9);

        manual.advance(Duration::from_millis(1000));
        assert_eq!(clock.in_good_time(), Timeliness::Late);
        assert!(clock.ensure_good_timing().is_ok());

        manual.advance(Duration::from_millis(1000));
        assert_eq!(clock.in_good_time(), Timeliness::TooLate);
        assert!(matches!(clock.ensure_good_timing(), Err(Error::Timing)));
    }

    #[test]
    fn cancelled_sleeps_return_false() {
        let (_manual, mut clock) = clock();
        let (sender, cancel) = cancel();
        drop(sender);
        assert!(!clock.sleep(1.0, &cancel));
    }

    #[test]
    fn system_clock_waits_are_cancellable() {
        let (sender, cancel) = cancel();
        drop(sender);
        let deadline = SystemTime::now() + Duration::from_secs(60);
        assert!(!SystemClock.wait_until(deadline, &cancel));
    }
}
