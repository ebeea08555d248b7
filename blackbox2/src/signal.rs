// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, Mutex};

/// A broadcast seam: observers subscribe closures, emitters fire a value
/// at every live subscriber.
///
/// Handles are cheap to clone and all point at the same slot list, which
/// lets an object clone a signal out from under its own lock and emit
/// with the lock released. Emission snapshots the slot list first, so a
/// subscriber may drop its own `Subscription` (or add new ones) from
/// inside a callback without deadlocking.
///
/// Subscribers that reach back into the object that owns the signal must
/// capture a `Weak` handle to it, never an `Arc`, or the signal keeps its
/// owner alive forever.
pub struct Signal<T> {
    state: Arc<Mutex<SlotList<T>>>,
}

struct SlotList<T> {
    next_id: u64,
    slots: Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal { state: Arc::clone(&self.state) }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal { state: Arc::new(Mutex::new(SlotList { next_id: 0, slots: Vec::new() })) }
    }

    pub fn emit(&self, value: &T) {
        let slots: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.slots.iter().map(|(_, f)| Arc::clone(f)).collect()
        };
        for slot in slots {
            slot(value);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }
}

impl<T: 'static> Signal<T> {
    /// Add a subscriber. The slot lives until the returned Subscription
    /// is dropped.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            // unwrap to propagate lock poisoning
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.slots.push((id, Arc::new(f)));
            id
        };

        let weak_state = Arc::downgrade(&self.state);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(state) = weak_state.upgrade() {
                    let mut state = state.lock().unwrap();
                    state.slots.retain(|(slot_id, _)| *slot_id != id);
                }
            })),
        }
    }
}

/// Keeps one signal slot alive; dropping it detaches the subscriber. A
/// Subscription does not keep its signal alive, it only removes its own
/// slot if the signal is still around when it drops.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[test]
    fn emit_reaches_every_subscriber() {
        let signal: Signal<u64> = Signal::new();
        let hits = Arc::new(AtomicU64::new(0));

        let h1 = Arc::clone(&hits);
        let _s1 = signal.subscribe(move |v| {
            h1.fetch_add(*v, Ordering::SeqCst);
        });
        let h2 = Arc::clone(&hits);
        let _s2 = signal.subscribe(move |v| {
            h2.fetch_add(*v, Ordering::SeqCst);
        });

        signal.emit(&21);
        assert_eq!(hits.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn dropping_subscription_detaches() {
        let signal: Signal<u64> = Signal::new();
        let hits = Arc::new(AtomicU64::new(0));

        let h = Arc::clone(&hits);
        let sub = signal.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit(&0);
        drop(sub);
        signal.emit(&0);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn clones_share_slots() {
        let signal: Signal<()> = Signal::new();
        let clone = signal.clone();
        let hits = Arc::new(AtomicU64::new(0));

        let h = Arc::clone(&hits);
        let _sub = signal.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        clone.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_outliving_signal_is_harmless() {
        let signal: Signal<()> = Signal::new();
        let sub = signal.subscribe(|_| {});
        drop(signal);
        drop(sub);
    }

    #[test]
    fn subscriber_may_detach_itself_during_emit() {
        let signal: Signal<()> = Signal::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_in_cb = Arc::clone(&slot);
        let sub = signal.subscribe(move |_| {
            // drop our own subscription from inside the callback
            slot_in_cb.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        signal.emit(&());
        assert_eq!(signal.subscriber_count(), 0);
    }
}
