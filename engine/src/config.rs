//! Engine configuration.

use crate::backoff::BackoffPolicy;
use crate::conflict::ResolutionStrategy;
use std::env;
use std::time::Duration;

/// Default quota assumed for on-device storage.
pub const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 500 * 1024 * 1024;

/// Connection pool settings for the tenant database manager.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of open tenant connections
    pub max_connections: usize,
    /// Idle time after which a non-current connection is closed
    pub idle_timeout: Duration,
    /// Interval of the idle sweep
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Sync pass settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Maximum operations pushed per pass
    pub batch_size: usize,
    /// Page size when pulling server changes
    pub pull_page_size: usize,
    /// Resolve low severity conflicts without asking
    pub auto_resolve_low_severity: bool,
    /// Strategy used for automatic resolution
    pub low_severity_strategy: ResolutionStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            pull_page_size: 100,
            auto_resolve_low_severity: true,
            low_severity_strategy: ResolutionStrategy::LastWriteWins,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub backoff: BackoffPolicy,
    pub sync: SyncConfig,
    /// Age after which resolved temp id mappings are garbage-collected
    pub id_mapping_max_age: Duration,
    /// Storage quota used by backends that cannot query one
    pub storage_quota_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            backoff: BackoffPolicy::default(),
            sync: SyncConfig::default(),
            id_mapping_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            storage_quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `PRACTICE_SYNC_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let pool = PoolConfig {
            max_connections: parse_var("PRACTICE_SYNC_MAX_CONNECTIONS")?
                .unwrap_or(defaults.pool.max_connections),
            idle_timeout: parse_var("PRACTICE_SYNC_IDLE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool.idle_timeout),
            sweep_interval: parse_var("PRACTICE_SYNC_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool.sweep_interval),
        };
        if pool.max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "PRACTICE_SYNC_MAX_CONNECTIONS",
                reason: "must be at least 1".to_string(),
            });
        }

        let backoff = BackoffPolicy {
            base: parse_var("PRACTICE_SYNC_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff.base),
            max: parse_var("PRACTICE_SYNC_BACKOFF_MAX_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff.max),
            multiplier: defaults.backoff.multiplier,
        };

        let low_severity_strategy = match env::var("PRACTICE_SYNC_LOW_SEVERITY_STRATEGY") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "PRACTICE_SYNC_LOW_SEVERITY_STRATEGY",
                reason: format!("unknown strategy '{}'", value),
            })?,
            Err(_) => defaults.sync.low_severity_strategy,
        };

        let sync = SyncConfig {
            batch_size: parse_var("PRACTICE_SYNC_BATCH_SIZE")?.unwrap_or(defaults.sync.batch_size),
            pull_page_size: parse_var("PRACTICE_SYNC_PULL_PAGE_SIZE")?
                .unwrap_or(defaults.sync.pull_page_size),
            auto_resolve_low_severity: parse_var("PRACTICE_SYNC_AUTO_RESOLVE_LOW")?
                .unwrap_or(defaults.sync.auto_resolve_low_severity),
            low_severity_strategy,
        };

        Ok(Self {
            pool,
            backoff,
            sync,
            id_mapping_max_age: parse_var("PRACTICE_SYNC_ID_MAPPING_MAX_AGE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.id_mapping_max_age),
            storage_quota_bytes: parse_var("PRACTICE_SYNC_STORAGE_QUOTA_BYTES")?
                .unwrap_or(defaults.storage_quota_bytes),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name,
                reason: format!("cannot parse '{}'", raw),
            }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
