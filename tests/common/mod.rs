//! Shared test fixtures for kv-transactions integration tests
//!
//! # Usage
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use kv_transactions::{
    Collection, DocumentId, DurabilityLevel, HooksConfig, MemoryStore, StaticResolver,
    TransactionsConfig, TransactionsManager,
};
use serde_json::Value;
use std::sync::{Arc, Once};
use std::time::Duration;

pub const BUCKET: &str = "default";

static TRACING: Once = Once::new();

/// Install a test subscriber once per test binary; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A store, a collection on it, and a manager resolving its bucket
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub coll: Collection,
    pub manager: Arc<TransactionsManager>,
}

impl Harness {
    pub fn id(&self, key: &str) -> DocumentId {
        self.coll.id(key)
    }

    /// Visible body of `key`, `None` if missing or a tombstone
    pub fn body(&self, key: &str) -> Option<Value> {
        self.store.raw_document(&self.id(key)).and_then(|d| d.body)
    }

    /// Whether `key` still carries a staging marker
    pub fn has_marker(&self, key: &str) -> bool {
        self.store
            .raw_document(&self.id(key))
            .map(|d| d.xattrs.get("txn").is_some_and(|m| !m.is_null()))
            .unwrap_or(false)
    }

    /// ATR keys present in the default collection
    pub fn atr_keys(&self) -> Vec<String> {
        self.store
            .keys("_default", "_default")
            .into_iter()
            .filter(|k| k.starts_with("_txn:atr-"))
            .filter(|k| {
                self.store
                    .raw_document(&self.id(k))
                    .is_some_and(|d| d.body.is_some())
            })
            .collect()
    }
}

/// Baseline config for tests: no durability, short expiry
pub fn test_config(store: &Arc<MemoryStore>) -> TransactionsConfig {
    let mut config = TransactionsConfig::default()
        .with_resolver(Arc::new(StaticResolver::new().with_store(store.clone())));
    config.durability_level = DurabilityLevel::None;
    config.expiration_time = Duration::from_secs(5);
    config.kv_timeout = Duration::from_secs(1);
    config
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with_hooks(hooks: HooksConfig) -> Harness {
    harness_with(move |config| config.hooks = hooks)
}

/// Build a harness, letting the caller adjust the config first
pub fn harness_with(adjust: impl FnOnce(&mut TransactionsConfig)) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryStore::new(BUCKET));
    let mut config = test_config(&store);
    adjust(&mut config);
    let manager = Arc::new(TransactionsManager::new(config).unwrap());
    Harness {
        coll: Collection::default_collection(store.clone()),
        store,
        manager,
    }
}
