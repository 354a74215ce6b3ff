//! Observer registration with per-subscriber error isolation.

use std::sync::{Arc, Mutex};
use tracing::warn;

pub type Subscriber<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// List of callbacks notified synchronously.
///
/// A failing subscriber is logged and skipped; it never affects the
/// notifying operation or the remaining subscribers.
pub struct Observers<T> {
    name: &'static str,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Observers<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: Subscriber<T>) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every subscriber with `value`.
    pub fn notify(&self, value: &T) {
        // Snapshot so callbacks may subscribe without deadlocking
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (idx, subscriber) in subscribers.iter().enumerate() {
            if let Err(e) = subscriber(value) {
                warn!(observers = self.name, subscriber = idx, error = %e, "Subscriber failed");
            }
        }
    }
}
