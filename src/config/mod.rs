//! Configuration module for kv-transactions
//!
//! This module is organized into submodules:
//! - `defaults` - Default constants and values
//! - `durability` - Durability levels
//! - `options` - Per-transaction overrides
//! - `file` - TOML configuration file
//!
//! [`TransactionsConfig`] is set once per [`TransactionsManager`] and shared
//! by every transaction and both background workers. Zero durations fall
//! back to the documented defaults; anything out of range is rejected when
//! the manager is built.
//!
//! [`TransactionsManager`]: crate::TransactionsManager

pub mod defaults;
mod durability;
pub mod file;
mod options;

pub use defaults::*;
pub use durability::DurabilityLevel;
pub use file::ConfigFile;
pub use options::TransactionOptions;

use crate::error::{ConfigError, Result};
use crate::hooks::HooksConfig;
use crate::storage::{DocumentLocation, NoStoreResolver, StoreResolver};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Process-wide transactions configuration
///
/// # Example
///
/// ```rust,ignore
/// use kv_transactions::{TransactionsConfig, TransactionsManager, DurabilityLevel};
///
/// let config = TransactionsConfig {
///     durability_level: DurabilityLevel::None,
///     expiration_time: Duration::from_secs(15),
///     ..Default::default()
/// };
/// let manager = TransactionsManager::new(config)?;
/// ```
#[derive(Clone)]
pub struct TransactionsConfig {
    /// How long an attempt may run before it expires
    pub expiration_time: Duration,

    /// Durability level required for every transactional write
    pub durability_level: DurabilityLevel,

    /// Timeout of each key-value request
    pub kv_timeout: Duration,

    /// Period in which the lost-transaction sweeper visits every owned shard
    pub cleanup_window: Duration,

    /// Extra time past an attempt's expiry before the cleanup queue acts
    pub cleanup_grace: Duration,

    /// Capacity of the client cleanup queue
    pub cleanup_queue_capacity: usize,

    /// Number of ATR shards per location
    pub num_atrs: u32,

    /// Run the client cleanup queue
    pub cleanup_client_attempts: bool,

    /// Run the lost-transaction sweeper
    pub cleanup_lost_attempts: bool,

    /// Silence after which another sweeper is considered gone
    pub client_staleness_threshold: Duration,

    /// Requeue attempts for a transiently failing cleanup request
    pub cleanup_max_retries: u32,

    /// Delay before a requeued cleanup request runs again
    pub cleanup_retry_delay: Duration,

    /// Collection holding ATR documents instead of the first written document's
    pub custom_atr_location: Option<DocumentLocation>,

    /// Locations the sweeper monitors from startup
    pub cleanup_locations: Vec<DocumentLocation>,

    /// Resolves bucket names for background work
    pub resolver: Arc<dyn StoreResolver>,

    pub hooks: HooksConfig,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            expiration_time: DEFAULT_EXPIRATION_TIME,
            durability_level: DurabilityLevel::Majority,
            kv_timeout: DEFAULT_KV_TIMEOUT,
            cleanup_window: DEFAULT_CLEANUP_WINDOW,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            cleanup_queue_capacity: DEFAULT_CLEANUP_QUEUE_CAPACITY,
            num_atrs: DEFAULT_NUM_ATRS,
            cleanup_client_attempts: true,
            cleanup_lost_attempts: true,
            client_staleness_threshold: DEFAULT_CLIENT_STALENESS_THRESHOLD,
            cleanup_max_retries: DEFAULT_CLEANUP_MAX_RETRIES,
            cleanup_retry_delay: DEFAULT_CLEANUP_RETRY_DELAY,
            custom_atr_location: None,
            cleanup_locations: Vec::new(),
            resolver: Arc::new(NoStoreResolver),
            hooks: HooksConfig::default(),
        }
    }
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

impl TransactionsConfig {
    pub fn with_resolver(mut self, resolver: Arc<dyn StoreResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_hooks(mut self, hooks: HooksConfig) -> Self {
        self.hooks = hooks;
        self
    }

    /// Fill zero durations with defaults and validate ranges
    pub fn normalized(mut self) -> Result<Self> {
        self.expiration_time = or_default(self.expiration_time, DEFAULT_EXPIRATION_TIME);
        self.kv_timeout = or_default(self.kv_timeout, DEFAULT_KV_TIMEOUT);
        self.cleanup_window = or_default(self.cleanup_window, DEFAULT_CLEANUP_WINDOW);
        self.client_staleness_threshold = or_default(
            self.client_staleness_threshold,
            DEFAULT_CLIENT_STALENESS_THRESHOLD,
        );

        if self.num_atrs == 0 || self.num_atrs > MAX_NUM_ATRS {
            return Err(ConfigError::invalid_setting(
                "num_atrs",
                format!("must be in [1, {}], got {}", MAX_NUM_ATRS, self.num_atrs),
            )
            .into());
        }
        if self.cleanup_queue_capacity == 0 {
            return Err(
                ConfigError::invalid_setting("cleanup_queue_capacity", "must be positive").into(),
            );
        }
        Ok(self)
    }
}

impl fmt::Debug for TransactionsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionsConfig")
            .field("expiration_time", &self.expiration_time)
            .field("durability_level", &self.durability_level)
            .field("kv_timeout", &self.kv_timeout)
            .field("cleanup_window", &self.cleanup_window)
            .field("cleanup_grace", &self.cleanup_grace)
            .field("cleanup_queue_capacity", &self.cleanup_queue_capacity)
            .field("num_atrs", &self.num_atrs)
            .field("cleanup_client_attempts", &self.cleanup_client_attempts)
            .field("cleanup_lost_attempts", &self.cleanup_lost_attempts)
            .field("client_staleness_threshold", &self.client_staleness_threshold)
            .field("custom_atr_location", &self.custom_atr_location)
            .field("cleanup_locations", &self.cleanup_locations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransactionError;

    #[test]
    fn test_defaults() {
        let config = TransactionsConfig::default();
        assert_eq!(config.expiration_time, Duration::from_secs(10));
        assert_eq!(config.durability_level, DurabilityLevel::Majority);
        assert_eq!(config.kv_timeout, Duration::from_millis(2500));
        assert_eq!(config.cleanup_window, Duration::from_secs(60));
        assert_eq!(config.cleanup_queue_capacity, 100_000);
        assert_eq!(config.num_atrs, 1024);
        assert!(config.cleanup_client_attempts);
        assert!(config.cleanup_lost_attempts);
    }

    #[test]
    fn test_zero_durations_fall_back() {
        let config = TransactionsConfig {
            expiration_time: Duration::ZERO,
            kv_timeout: Duration::ZERO,
            cleanup_window: Duration::ZERO,
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(config.expiration_time, DEFAULT_EXPIRATION_TIME);
        assert_eq!(config.kv_timeout, DEFAULT_KV_TIMEOUT);
        assert_eq!(config.cleanup_window, DEFAULT_CLEANUP_WINDOW);
    }

    #[test]
    fn test_num_atrs_range() {
        for bad in [0, 1025, 2000] {
            let err = TransactionsConfig {
                num_atrs: bad,
                ..Default::default()
            }
            .normalized()
            .unwrap_err();
            assert!(matches!(err, TransactionError::Config(_)));
        }
        assert!(TransactionsConfig {
            num_atrs: 1,
            ..Default::default()
        }
        .normalized()
        .is_ok());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let result = TransactionsConfig {
            cleanup_queue_capacity: 0,
            ..Default::default()
        }
        .normalized();
        assert!(result.is_err());
    }
}
