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

//! Counting the synths a scope has started and not yet seen finish.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

/// What a tracker counts. A live synth is tracked per group it has lived in, so moving it to a
/// new FX block finishes it in the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tracked {
    Synth(i32),
    LiveSynth { node_id: i32, group_id: i32 },
}

/// The synths running on behalf of a thread or FX block.
///
/// Cloning a tracker gives another handle to the same set.
#[derive(Clone, Default)]
pub struct SynthTracker(Arc<Mutex<TrackerState>>);

#[derive(Default)]
struct TrackerState {
    synths: HashSet<Tracked>,
    // Dropped when the set empties, which disconnects every waiting receiver.
    waiters: Vec<Sender<()>>,
}

impl SynthTracker {
    pub fn new() -> SynthTracker {
        SynthTracker::default()
    }

    pub fn synth_started(&self, synth: Tracked) {
        self.0.lock().synths.insert(synth);
    }

    /// Stops tracking a synth. Finishing an untracked synth does nothing.
    pub fn synth_finished(&self, synth: Tracked) {
        let mut state = self.0.lock();
        if state.synths.remove(&synth) && state.synths.is_empty() {
            state.waiters.clear();
        }
    }

    pub fn num_running(&self) -> usize {
        self.0.lock().synths.len()
    }

    /// Blocks until every tracked synth has finished.
    pub fn block_until_finished(&self) {
        while let Some(finished) = self.waiter() {
            let _ = finished.recv();
        }
    }

    /// Like [`SynthTracker::block_until_finished`], giving up after `timeout`. Returns whether
    /// every synth finished.
    pub fn block_until_finished_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while let Some(finished) = self.waiter() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if finished.recv_timeout(remaining).is_err() && Instant::now() >= deadline {
                return self.num_running() == 0;
            }
        }
        true
    }

    /// A receiver that disconnects once the set is empty, or `None` if it already is.
    fn waiter(&self) -> Option<Receiver<()>> {
        let mut state = self.0.lock();
        if state.synths.is_empty() {
            return None;
        }
        let (sender, receiver) = bounded(0);
        state.waiters.push(sender);
        Some(receiver)
    }

    pub fn ptr_eq(&self, other: &SynthTracker) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SynthTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthTracker")
            .field("running", &self.num_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_tracker_does_not_block() {
        SynthTracker::new().block_until_finished();
    }

    #[test]
    fn blocks_until_the_last_synth_finishes() {
        let tracker = SynthTracker::new();
        tracker.synth_started(Tracked::Synth(1));
        tracker.synth_started(Tracked::Synth(2));
        tracker.synth_finished(Tracked::Synth(7));
        assert_eq!(tracker.num_running(), 2);

        let finisher = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                tracker.synth_finished(Tracked::Synth(1));
                tracker.synth_finished(Tracked::Synth(2));
            })
        };
        tracker.block_until_finished();
        finisher.join().unwrap();
        assert_eq!(tracker.num_running(), 0);
    }

    #[test]
    fn every_waiter_wakes_when_the_last_synth_finishes() {
        let tracker = SynthTracker::new();
        tracker.synth_started(Tracked::Synth(3));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let tracker = tracker.clone();
                thread::spawn(move || tracker.block_until_finished())
            })
            .collect();
        tracker.synth_finished(Tracked::Synth(3));
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn live_synths_are_tracked_per_group() {
        let tracker = SynthTracker::new();
        tracker.synth_started(Tracked::LiveSynth {
            node_id: 5,
            group_id: 10,
        });
        tracker.synth_finished(Tracked::Synth(5));
        assert!(!tracker.block_until_finished_timeout(Duration::from_millis(10)));
        tracker.synth_finished(Tracked::LiveSynth {
            node_id: 5,
            group_id: 10,
        });
        assert!(tracker.block_until_finished_timeout(Duration::from_millis(10)));
    }
}
