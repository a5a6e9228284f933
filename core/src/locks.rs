//! Per-key exclusive locks.
//!
//! RULE: There is no global decision lock. Two calls contend only if
//! they name the same key (one request, or one payout account).
//! Slots are created on demand and dropped once nobody holds them.

use crate::error::{EngineError, EngineResult};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> EngineResult<Arc<Mutex<()>>> {
        let mut slots = self.slots.lock().map_err(|_| EngineError::LockPoisoned("keyed lock table"))?;
        Ok(slots.entry(key.to_string()).or_default().clone())
    }

    fn prune(&self, key: &str) {
        if let Ok(mut slots) = self.slots.lock() {
            // One reference for the table itself: nobody else is waiting.
            if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                slots.remove(key);
            }
        }
    }

    /// Run `work` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &str, work: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
        let slot = self.slot(key)?;
        let result = {
            let _held = slot.lock().map_err(|_| EngineError::LockPoisoned("keyed lock slot"))?;
            work()
        };
        drop(slot);
        self.prune(key);
        result
    }

    /// Number of live slots. Used by tests to check cleanup.
    pub fn live_slots(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}
