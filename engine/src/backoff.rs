//! Exponential retry backoff for failed sync operations.
//!
//! Failed operations are retried forever; the backoff only spaces the
//! attempts out so a persistently failing endpoint is not hammered.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor between consecutive failures
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `retry_count`-th consecutive failure.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = retry_count.saturating_sub(1).min(32);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max)
    }

    /// Timestamp (ms) before which the operation should not be retried.
    pub fn next_attempt_at(&self, now: crate::Timestamp, retry_count: u32) -> crate::Timestamp {
        now.saturating_add(self.delay_for(retry_count).as_millis() as u64)
    }
}
