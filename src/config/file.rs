//! Configuration file support for kv-transactions
//!
//! ## Example Configuration
//!
//! ```toml
//! # kv-transactions.toml
//!
//! [transactions]
//! expiration_time_ms = 15000
//! durability_level = "majority"
//! kv_timeout_ms = 2500
//! num_atrs = 1024
//!
//! [cleanup]
//! client_attempts = true
//! lost_attempts = true
//! window_ms = 60000
//! queue_capacity = 100000
//!
//! [[cleanup.locations]]
//! bucket = "travel"
//! scope = "inventory"
//! collection = "items"
//!
//! [metadata]
//! bucket = "travel"
//! scope = "_default"
//! collection = "txn-meta"
//! ```
//!
//! Every field is optional; missing fields keep the value of the config the
//! file is applied to.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{DurabilityLevel, TransactionsConfig};
use crate::error::{ConfigError, Result};
use crate::storage::DocumentLocation;

/// Root configuration structure for TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Attempt settings
    pub transactions: TransactionsSection,

    /// Background cleanup settings
    pub cleanup: CleanupSection,

    /// Custom location for ATR documents
    pub metadata: Option<LocationSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionsSection {
    pub expiration_time_ms: Option<u64>,

    /// One of none, majority, majority_and_persist_to_active, persist_to_majority
    pub durability_level: Option<String>,

    pub kv_timeout_ms: Option<u64>,

    pub num_atrs: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSection {
    pub client_attempts: Option<bool>,
    pub lost_attempts: Option<bool>,
    pub window_ms: Option<u64>,
    pub grace_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub client_staleness_threshold_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,

    /// Locations swept from startup
    pub locations: Vec<LocationSection>,
}

/// A bucket/scope/collection triple; scope and collection default to `_default`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSection {
    pub bucket: String,
    pub scope: Option<String>,
    pub collection: Option<String>,
}

impl LocationSection {
    fn to_location(&self) -> DocumentLocation {
        DocumentLocation::new(
            &self.bucket,
            self.scope.as_deref().unwrap_or("_default"),
            self.collection.as_deref().unwrap_or("_default"),
        )
    }
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        toml::from_str(&contents).map_err(|e| {
            ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Try to load configuration from default locations
    ///
    /// Searches in order:
    /// 1. ./kv-transactions.toml
    /// 2. /etc/kv-transactions/kv-transactions.toml
    pub fn load_default() -> Option<Self> {
        let default_paths = [
            PathBuf::from("kv-transactions.toml"),
            PathBuf::from("/etc/kv-transactions/kv-transactions.toml"),
        ];

        for path in default_paths.iter() {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "Loaded transactions configuration");
                        return Some(config);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to load transactions configuration");
                    }
                }
            }
        }

        None
    }
}

impl TransactionsConfig {
    /// Apply the settings present in `file` on top of `self`
    pub fn from_file_config(mut self, file: &ConfigFile) -> Result<Self> {
        let txn = &file.transactions;
        if let Some(ms) = txn.expiration_time_ms {
            self.expiration_time = Duration::from_millis(ms);
        }
        if let Some(level) = &txn.durability_level {
            self.durability_level = level
                .parse::<DurabilityLevel>()
                .map_err(|e| ConfigError::invalid_setting("transactions.durability_level", e))?;
        }
        if let Some(ms) = txn.kv_timeout_ms {
            self.kv_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = txn.num_atrs {
            self.num_atrs = n;
        }

        let cleanup = &file.cleanup;
        if let Some(enabled) = cleanup.client_attempts {
            self.cleanup_client_attempts = enabled;
        }
        if let Some(enabled) = cleanup.lost_attempts {
            self.cleanup_lost_attempts = enabled;
        }
        if let Some(ms) = cleanup.window_ms {
            self.cleanup_window = Duration::from_millis(ms);
        }
        if let Some(ms) = cleanup.grace_ms {
            self.cleanup_grace = Duration::from_millis(ms);
        }
        if let Some(capacity) = cleanup.queue_capacity {
            self.cleanup_queue_capacity = capacity;
        }
        if let Some(ms) = cleanup.client_staleness_threshold_ms {
            self.client_staleness_threshold = Duration::from_millis(ms);
        }
        if let Some(retries) = cleanup.max_retries {
            self.cleanup_max_retries = retries;
        }
        if let Some(ms) = cleanup.retry_delay_ms {
            self.cleanup_retry_delay = Duration::from_millis(ms);
        }
        self.cleanup_locations
            .extend(cleanup.locations.iter().map(LocationSection::to_location));

        if let Some(metadata) = &file.metadata {
            self.custom_atr_location = Some(metadata.to_location());
        }

        self.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_empty_config() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert!(config.transactions.expiration_time_ms.is_none());
        assert!(config.cleanup.locations.is_empty());
        assert!(config.metadata.is_none());
    }

    #[test]
    fn test_parse_and_apply() {
        let toml = r#"
            [transactions]
            expiration_time_ms = 15000
            durability_level = "persist_to_majority"
            num_atrs = 64

            [cleanup]
            lost_attempts = false
            window_ms = 5000

            [[cleanup.locations]]
            bucket = "travel"
            scope = "inventory"
            collection = "items"

            [metadata]
            bucket = "meta"
        "#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        let config = TransactionsConfig::default().from_file_config(&file).unwrap();

        assert_eq!(config.expiration_time, Duration::from_secs(15));
        assert_eq!(config.durability_level, DurabilityLevel::PersistToMajority);
        assert_eq!(config.num_atrs, 64);
        assert!(!config.cleanup_lost_attempts);
        assert!(config.cleanup_client_attempts);
        assert_eq!(config.cleanup_window, Duration::from_secs(5));
        assert_eq!(
            config.cleanup_locations,
            vec![DocumentLocation::new("travel", "inventory", "items")]
        );
        assert_eq!(
            config.custom_atr_location,
            Some(DocumentLocation::default_collection("meta"))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file: ConfigFile = toml::from_str(
            r#"
            [transactions]
            durability_level = "sometimes"
        "#,
        )
        .unwrap();
        assert!(TransactionsConfig::default().from_file_config(&file).is_err());

        let file: ConfigFile = toml::from_str("[transactions]\nnum_atrs = 2000").unwrap();
        assert!(TransactionsConfig::default().from_file_config(&file).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[transactions]\nkv_timeout_ms = 1000").unwrap();
        let file = ConfigFile::load(tmp.path()).unwrap();
        assert_eq!(file.transactions.kv_timeout_ms, Some(1000));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "[transactions\n").unwrap();
        assert!(ConfigFile::load(broken.path()).is_err());
        assert!(ConfigFile::load("/nonexistent/kv-transactions.toml").is_err());
    }
}
