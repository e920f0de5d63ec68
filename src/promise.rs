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

//! Single-assignment values for one-shot signals between threads.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};

/// A value that is delivered once and read by any number of waiters.
///
/// Besides blocking on [`Promise::get`], waiters can include [`Promise::signal`] in a
/// `crossbeam_channel::select!`: the receiver disconnects once the value is delivered.
pub struct Promise<T>(Arc<PromiseInner<T>>);

struct PromiseInner<T> {
    value: Mutex<Option<T>>,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Promise<T> {
        Promise(self.0.clone())
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Promise<T> {
        Promise::new()
    }
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Promise<T> {
        let (sender, receiver) = bounded(0);
        Promise(Arc::new(PromiseInner {
            value: Mutex::new(None),
            sender: Mutex::new(Some(sender)),
            receiver,
        }))
    }

    /// Delivers `value`, returning false if a value was already delivered.
    pub fn deliver(&self, value: T) -> bool {
        {
            let mut slot = self.0.value.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.0.sender.lock().take();
        true
    }

    /// Blocks until a value is delivered.
    pub fn get(&self) -> T {
        loop {
            if let Some(value) = self.try_get() {
                return value;
            }
            let _ = self.0.receiver.recv();
        }
    }

    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        if let Some(value) = self.try_get() {
            return Some(value);
        }
        let _ = self.0.receiver.recv_timeout(timeout);
        self.try_get()
    }

    pub fn try_get(&self) -> Option<T> {
        self.0.value.lock().clone()
    }

    pub fn is_delivered(&self) -> bool {
        self.0.value.lock().is_some()
    }

    /// A receiver that disconnects when the value is delivered.
    pub fn signal(&self) -> &Receiver<()> {
        &self.0.receiver
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&*self.0.value.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::select;
    use std::thread;

    #[test]
    fn first_delivery_wins() {
        let promise = Promise::new();
        assert!(promise.deliver(1));
        assert!(!promise.deliver(2));
        assert_eq!(promise.get(), 1);
    }

    #[test]
    fn waiters_wake_on_delivery() {
        let promise = Promise::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let promise = promise.clone();
                thread::spawn(move || promise.get())
            })
            .collect();
        promise.deliver("done");
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), "done");
        }
    }

    #[test]
    fn timeouts() {
        let promise: Promise<i32> = Promise::new();
        assert_eq!(promise.get_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn selects_between_promises() {
        let a: Promise<()> = Promise::new();
        let b: Promise<()> = Promise::new();
        b.deliver(());
        let winner = select! {
            recv(a.signal()) -> _ => "a",
            recv(b.signal()) -> _ => "b",
        };
        assert_eq!(winner, "b");
    }
}
