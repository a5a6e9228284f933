//! Time source for the engine.
//!
//! RULE: Nothing in the core calls `Utc::now()` directly.
//! Every timestamp flows through a `Clock` so tests can pin time and
//! so every stored instant has the same (millisecond) precision.

use crate::types::{from_millis, to_millis, Timestamp};
use chrono::Duration;
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Real wall clock, truncated to milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        from_millis(to_millis(chrono::Utc::now()))
    }
}

/// Manually advanced clock for tests and scripted runs.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { current: Mutex::new(from_millis(to_millis(start))) }
    }

    /// Starts at 2024-01-01T00:00:00Z.
    pub fn at_epoch() -> Self {
        Self::new(from_millis(1_704_067_200_000))
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.current.lock() {
            *current += by;
        }
    }

    pub fn set(&self, to: Timestamp) {
        if let Ok(mut current) = self.current.lock() {
            *current = from_millis(to_millis(to));
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.current
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}
