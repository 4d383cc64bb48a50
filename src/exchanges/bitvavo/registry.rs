use crate::exchanges::bitvavo::types::SubscriptionKey;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Callback invoked for every event on a subscription
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Active subscriptions keyed by channel, market and optional sub-key
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionKey, EventCallback>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, EventCallback>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback`, returning the one it replaced for the same key
    pub fn add(&self, key: SubscriptionKey, callback: EventCallback) -> Option<EventCallback> {
        self.entries().insert(key, callback)
    }

    pub fn remove(&self, key: &SubscriptionKey) -> Option<EventCallback> {
        self.entries().remove(key)
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries().contains_key(key)
    }

    /// Invoke the callback registered for `key`.
    ///
    /// The callback runs after the lock is released, so it may itself add or
    /// remove subscriptions. Returns `false` when nothing is registered.
    pub fn dispatch(&self, key: &SubscriptionKey, payload: &Value) -> bool {
        let callback = self.entries().get(key).cloned();
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
