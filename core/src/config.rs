use crate::types::MinorUnits;
use serde::{Deserialize, Serialize};

/// Backoff settings for one kind of post-commit work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_attempts:  usize,
    pub base_delay_ms: u64,
    pub max_delay_ms:  u64,
    pub jitter_pct:    f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// ISO 4217 code. Only the presentation layer looks at it.
    pub currency:          String,
    /// Upper bound on a single bid, in minor units. `None` = unbounded.
    #[serde(default)]
    pub max_bid_amount:    Option<MinorUnits>,
    /// How long SQLite waits on a locked database file.
    pub busy_timeout_ms:   u64,
    /// Re-runs of a settlement after losing an optimistic version check.
    pub max_stale_retries: usize,
    pub stats_retry:       RetryConfig,
    pub notify_retry:      RetryConfig,
    /// Seed for retry jitter.
    pub jitter_seed:       u64,
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields are an error; use
    /// `EngineConfig::default()` as the starting point for new files.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.currency.len() != 3 {
            anyhow::bail!("currency must be a 3-letter code, got '{}'", self.currency);
        }
        if let Some(max) = self.max_bid_amount {
            if max <= 0 {
                anyhow::bail!("max_bid_amount must be positive, got {max}");
            }
        }
        Ok(())
    }

    /// Config with no waiting anywhere, for tests.
    pub fn default_test() -> Self {
        let instant = RetryConfig {
            max_attempts:  3,
            base_delay_ms: 0,
            max_delay_ms:  0,
            jitter_pct:    0.0,
        };
        Self {
            currency:          "USD".into(),
            max_bid_amount:    None,
            busy_timeout_ms:   1_000,
            max_stale_retries: 3,
            stats_retry:       instant.clone(),
            notify_retry:      instant,
            jitter_seed:       7,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency:          "USD".into(),
            max_bid_amount:    Some(100_000),
            busy_timeout_ms:   5_000,
            max_stale_retries: 3,
            stats_retry: RetryConfig {
                max_attempts:  5,
                base_delay_ms: 50,
                max_delay_ms:  2_000,
                jitter_pct:    0.2,
            },
            notify_retry: RetryConfig {
                max_attempts:  5,
                base_delay_ms: 250,
                max_delay_ms:  5_000,
                jitter_pct:    0.25,
            },
            jitter_seed: 0x5EED,
        }
    }
}
