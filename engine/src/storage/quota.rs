//! Storage quota accounting.

use serde::{Deserialize, Serialize};

/// Usage ratio above which storage is reported as nearly full.
pub const NEAR_LIMIT_RATIO: f64 = 0.8;

/// Bytes used and available to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

/// Outcome of checking whether a write fits in the quota.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCheck {
    pub usage: u64,
    pub quota: u64,
    pub requested: u64,
    pub available: u64,
    pub would_exceed: bool,
    /// Usage after the write crosses [`NEAR_LIMIT_RATIO`]
    pub near_limit: bool,
}

/// Check whether writing `requested` more bytes stays within the quota.
pub fn check_quota(estimate: StorageEstimate, requested: u64) -> QuotaCheck {
    let available = estimate.quota.saturating_sub(estimate.usage);
    let after = estimate.usage.saturating_add(requested);
    let near_limit = estimate.quota > 0 && (after as f64 / estimate.quota as f64) >= NEAR_LIMIT_RATIO;

    QuotaCheck {
        usage: estimate.usage,
        quota: estimate.quota,
        requested,
        available,
        would_exceed: after > estimate.quota,
        near_limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn write_past_quota_would_exceed() {
        let check = check_quota(
            StorageEstimate {
                usage: 450 * MB,
                quota: 500 * MB,
            },
            60 * MB,
        );
        assert!(check.would_exceed);
        assert_eq!(check.available, 50 * MB);
        assert!(check.near_limit);
    }

    #[test]
    fn write_within_quota_fits() {
        let check = check_quota(
            StorageEstimate {
                usage: 100 * MB,
                quota: 500 * MB,
            },
            60 * MB,
        );
        assert!(!check.would_exceed);
        assert!(!check.near_limit);
    }

    #[test]
    fn exact_fit_does_not_exceed() {
        let check = check_quota(StorageEstimate { usage: 10, quota: 20 }, 10);
        assert!(!check.would_exceed);
        assert_eq!(check.available, 10);
    }
}
