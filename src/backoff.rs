use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

/// Exponential backoff applied after consecutive failed queries.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "baseMs")]
    pub base: Duration,
    pub factor: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "maxMs")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    error_count: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            error_count: 0,
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn register_error(&mut self) -> Duration {
        self.error_count = self.error_count.saturating_add(1);
        // Anything past 2^63 saturates to `max` anyway.
        let exponent = self.error_count.saturating_sub(1).min(63) as i32;
        let delay = self.config.base.as_secs_f64() * self.config.factor.powi(exponent);
        let capped = delay.min(self.config.max.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn register_success(&mut self) {
        self.error_count = 0;
    }
}
