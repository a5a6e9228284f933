//! Jittered exponential backoff for post-commit work.

use crate::{config::RetryConfig, rng::JitterRng};
use std::{fmt::Display, thread, time::Duration};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts:  usize,
    pub base_delay_ms: u64,
    pub max_delay_ms:  u64,
    pub jitter_pct:    f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        Self {
            max_attempts:  max_attempts.max(1),
            base_delay_ms,
            max_delay_ms:  max_delay_ms.max(base_delay_ms),
            jitter_pct:    jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-based), before jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        Duration::from_millis(self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms))
    }

    fn next_delay(&self, attempt: usize, rng: &mut JitterRng) -> Duration {
        let delay = self.base_delay(attempt).as_millis() as u64;
        if self.jitter_pct == 0.0 || delay == 0 {
            return Duration::from_millis(delay);
        }
        let spread = (delay as f64 * self.jitter_pct) as i64;
        let delta = (rng.next_signed_unit() * spread as f64) as i64;
        Duration::from_millis(delay.saturating_add_signed(delta))
    }

    /// Run `op` until it succeeds or attempts run out. Each failure is
    /// logged at warn with `label`; the last error is returned.
    pub fn run<T, E, F>(&self, label: &str, rng: &mut JitterRng, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(usize) -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    log::warn!("{label}: attempt {attempt}/{} failed: {err}", self.max_attempts);
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt - 1, rng);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(cfg.max_attempts, cfg.base_delay_ms, cfg.max_delay_ms, cfg.jitter_pct)
    }
}
