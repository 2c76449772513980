use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Capped, jittered exponential backoff used for relists and reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay.
    pub initial_ms: u64,
    /// Ceiling; a delay never exceeds it, jitter included.
    pub max_ms: u64,
    /// Fraction of the delay shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self { Self { initial_ms: 200, max_ms: 30_000, jitter: 0.2 } }
}

impl BackoffConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let initial_ms = env_parse("INFORMA_BACKOFF_INITIAL_MS").unwrap_or(d.initial_ms).max(1);
        let max_ms = env_parse::<u64>("INFORMA_BACKOFF_MAX_SECS")
            .map(|s| s.saturating_mul(1000))
            .unwrap_or(d.max_ms)
            .max(initial_ms);
        let jitter = env_parse::<f64>("INFORMA_BACKOFF_JITTER")
            .filter(|j| j.is_finite())
            .unwrap_or(d.jitter)
            .clamp(0.0, 1.0);
        Self { initial_ms, max_ms, jitter }
    }

    pub fn max(&self) -> Duration { Duration::from_millis(self.max_ms) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InformerConfig {
    pub backoff: BackoffConfig,
}

impl InformerConfig {
    pub fn from_env() -> Self { Self { backoff: BackoffConfig::from_env() } }
}
