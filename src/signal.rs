//! Synchronous observer used for protocol events.
//!
//! `emit` delivers to every current subscriber on the emitting thread before
//! returning. Subscriptions are RAII guards: dropping one unsubscribes it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    entries: Vec<(u64, Slot<T>)>,
}

/// Event source with any number of subscribers.
pub struct Signal<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register `callback`. It stays connected until the returned guard drops.
    #[must_use = "dropping the subscription disconnects it immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut slots = self.slots.lock();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.entries.push((id, Arc::new(callback)));

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.slots);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots.lock().entries.retain(|(slot_id, _)| *slot_id != id);
                }
            })),
        }
    }

    /// Call every subscriber with `value`.
    pub fn emit(&self, value: &T) {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let snapshot: Vec<Slot<T>> = self
            .slots
            .lock()
            .entries
            .iter()
            .map(|(_, slot)| slot.clone())
            .collect();
        for slot in snapshot {
            slot(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().entries.len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.slots.lock().entries.len())
            .finish()
    }
}

/// RAII guard that disconnects its callback on drop.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Disconnect now. Equivalent to dropping the guard.
    pub fn unsubscribe(mut self) {
        self.disconnect();
    }

    fn disconnect(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disconnect();
    }
}
