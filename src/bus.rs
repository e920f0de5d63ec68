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

//! Allocation of audio busses and buffer numbers.
//!
//! The engine has a fixed number of audio busses. The first few are wired to the sound card, the
//! rest are private and handed out in stereo pairs to FX blocks and job mixers. Buffer numbers are
//! handed out the same way, one at a time.

use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Returned when every index in a pool is in use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("all {capacity} indices allocated, unable to allocate {requested} more")]
pub struct AllocationError {
    pub requested: usize,
    pub capacity: usize,
}

/// A pool of indices handed out in fixed-size runs, lowest first.
pub struct IndexAllocator {
    used: Mutex<Vec<bool>>,
    allocation_size: usize,
    offset: usize,
}

impl fmt::Debug for IndexAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexAllocator")
            .field("free", &self.free_count())
            .field("allocation_size", &self.allocation_size)
            .field("offset", &self.offset)
            .finish()
    }
}

impl IndexAllocator {
    /// Creates a pool covering indices `offset..max_index`, split into runs of
    /// `allocation_size`. A trailing partial run is never handed out.
    pub fn new(max_index: usize, allocation_size: usize, offset: usize) -> IndexAllocator {
        let allocation_size = allocation_size.max(1);
        let slots = max_index.saturating_sub(offset) / allocation_size;
        IndexAllocator {
            used: Mutex::new(vec![false; slots]),
            allocation_size,
            offset,
        }
    }

    /// Claims the lowest free run and returns its first index.
    pub fn allocate(&self) -> Result<usize, AllocationError> {
        let mut used = self.used.lock();
        match used.iter().position(|in_use| !in_use) {
            Some(slot) => {
                used[slot] = true;
                Ok(self.offset + slot * self.allocation_size)
            }
            None => Err(AllocationError {
                requested: self.allocation_size,
                capacity: used.len() * self.allocation_size,
            }),
        }
    }

    /// Returns a run to the pool. Releasing an index that is already free, or that this pool
    /// never handed out, does nothing.
    pub fn release(&self, index: usize) {
        if index < self.offset || (index - self.offset) % self.allocation_size != 0 {
            log::warn!("ignoring release of foreign index {}", index);
            return;
        }
        let slot = (index - self.offset) / self.allocation_size;
        if let Some(in_use) = self.used.lock().get_mut(slot) {
            *in_use = false;
        }
    }

    pub fn free_count(&self) -> usize {
        self.used.lock().iter().filter(|in_use| !**in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.used.lock().len()
    }

    /// Marks every index free again. Used when the engine reboots.
    pub fn reset(&self) {
        self.used.lock().iter_mut().for_each(|in_use| *in_use = false);
    }
}

/// Hands out stereo pairs of private audio busses.
#[derive(Debug, Clone)]
pub struct BusAllocator(Arc<IndexAllocator>);

impl BusAllocator {
    pub const ALLOCATION_SIZE: usize = 2;

    pub fn new(num_busses: usize, first_private_bus: usize) -> BusAllocator {
        BusAllocator(Arc::new(IndexAllocator::new(
            num_busses,
            Self::ALLOCATION_SIZE,
            first_private_bus,
        )))
    }

    pub fn allocate(&self) -> Result<AudioBus, AllocationError> {
        let index = self.0.allocate()?;
        log::debug!("allocated audio bus {}", index);
        Ok(AudioBus(Arc::new(AudioBusInner {
            index,
            allocator: self.0.clone(),
            freed: AtomicBool::new(false),
        })))
    }

    pub fn free_count(&self) -> usize {
        self.0.free_count()
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }

    pub fn reset(&self) {
        self.0.reset()
    }
}

/// An allocated stereo audio bus.
///
/// Clones share one allocation; the first call to [`AudioBus::free`] releases it.
#[derive(Clone)]
pub struct AudioBus(Arc<AudioBusInner>);

struct AudioBusInner {
    index: usize,
    allocator: Arc<IndexAllocator>,
    freed: AtomicBool,
}

impl AudioBus {
    pub fn index(&self) -> usize {
        self.0.index
    }

    pub fn to_i32(&self) -> i32 {
        self.0.index as i32
    }

    pub fn free(&self) {
        if !self.0.freed.swap(true, Ordering::SeqCst) {
            log::debug!("freed audio bus {}", self.0.index);
            self.0.allocator.release(self.0.index);
        }
    }

    pub fn is_freed(&self) -> bool {
        self.0.freed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AudioBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AudioBus({}", self.0.index)?;
        if self.is_freed() {
            write!(f, ", freed")?;
        }
        write!(f, ")")
    }
}

impl PartialEq for AudioBus {
    fn eq(&self, other: &AudioBus) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, thread};

    #[test]
    fn hands_out_lowest_free_pair() {
        let busses = BusAllocator::new(24, 16);
        let a = busses.allocate().unwrap();
        let b = busses.allocate().unwrap();
        assert_eq!((a.index(), b.index()), (16, 18));

        a.free();
        assert_eq!(busses.allocate().unwrap().index(), 16);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let busses = BusAllocator::new(20, 16);
        let _a = busses.allocate().unwrap();
        let _b = busses.allocate().unwrap();
        assert_eq!(
            busses.allocate().unwrap_err(),
            AllocationError {
                requested: 2,
                capacity: 4
            }
        );
    }

    #[test]
    fn double_free_is_harmless() {
        let busses = BusAllocator::new(20, 16);
        let a = busses.allocate().unwrap();
        let b = busses.allocate().unwrap();
        a.free();
        a.clone().free();
        assert_eq!(busses.free_count(), 1);
        let c = busses.allocate().unwrap();
        assert_ne!(c.index(), b.index());
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let busses = BusAllocator::new(1024, 16);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let busses = busses.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| busses.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let all: Vec<AudioBus> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        let unique: HashSet<usize> = all.iter().map(AudioBus::index).collect();
        assert_eq!(unique.len(), all.len());
        assert_eq!(busses.free_count(), busses.capacity() - 400);

        all.iter().for_each(AudioBus::free);
        assert_eq!(busses.free_count(), busses.capacity());
    }
}
