use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;
use crate::store::RetryPolicy;

/// One week.
pub const DEFAULT_BILLING_DUE_AFTER_MS: Ms = 604_800_000;

/// Settings the store and everything built on it need.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a transaction waits for a row lock before giving up with
    /// `TransientStore`.
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
    /// A Pending charge becomes Overdue this long after it was posted.
    pub billing_due_after_ms: Ms,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            billing_due_after_ms: DEFAULT_BILLING_DUE_AFTER_MS,
        }
    }
}

/// Process configuration, read from `CLASSBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Compact the WAL once this many frames were appended since the last compaction.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub store: StoreConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = StoreConfig::default();
        let retry = RetryPolicy {
            max_retries: env_parse("CLASSBOOK_MAX_RETRIES").unwrap_or(defaults.retry.max_retries),
            initial_delay: env_parse("CLASSBOOK_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            ..defaults.retry.clone()
        };

        Self {
            data_dir: std::env::var("CLASSBOOK_DATA_DIR")
                .unwrap_or_else(|_| "./data".into())
                .into(),
            metrics_port: env_parse("CLASSBOOK_METRICS_PORT"),
            compact_threshold: env_parse("CLASSBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            sweep_interval: env_parse("CLASSBOOK_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60)),
            store: StoreConfig {
                lock_timeout: env_parse("CLASSBOOK_LOCK_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.lock_timeout),
                retry,
                billing_due_after_ms: env_parse("CLASSBOOK_BILLING_DUE_AFTER_MS")
                    .unwrap_or(defaults.billing_due_after_ms),
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("classbook.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_lives_in_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/classbook"),
            metrics_port: None,
            compact_threshold: 10,
            sweep_interval: Duration::from_secs(1),
            store: StoreConfig::default(),
        };
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/classbook/classbook.wal"));
    }

    #[test]
    fn store_defaults_are_bounded() {
        let config = StoreConfig::default();
        assert!(config.retry.max_retries > 0);
        assert!(config.lock_timeout > Duration::ZERO);
        assert_eq!(config.billing_due_after_ms, DEFAULT_BILLING_DUE_AFTER_MS);
    }
}
