//! Bucket name to store resolution
//!
//! Background workers reach stores they never started a transaction
//! against, so every store is looked up by bucket name. Stores touched by
//! a live transaction are registered up front; anything else goes through
//! the configured [`StoreResolver`].

use crate::error::StoreError;
use crate::storage::backend::{DocumentStore, StoreResult};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Resolves a bucket name to a store handle
pub trait StoreResolver: Send + Sync {
    fn resolve(&self, bucket: &str) -> StoreResult<Arc<dyn DocumentStore>>;
}

impl<F> StoreResolver for F
where
    F: Fn(&str) -> StoreResult<Arc<dyn DocumentStore>> + Send + Sync,
{
    fn resolve(&self, bucket: &str) -> StoreResult<Arc<dyn DocumentStore>> {
        self(bucket)
    }
}

/// Resolver used when none is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStoreResolver;

impl StoreResolver for NoStoreResolver {
    fn resolve(&self, bucket: &str) -> StoreResult<Arc<dyn DocumentStore>> {
        Err(StoreError::InvalidArgument(format!(
            "no store resolver was specified (bucket {})",
            bucket
        )))
    }
}

/// Fixed set of stores keyed by bucket name
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    stores: HashMap<String, Arc<dyn DocumentStore>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.stores.insert(store.bucket_name().to_string(), store);
        self
    }
}

impl StoreResolver for StaticResolver {
    fn resolve(&self, bucket: &str) -> StoreResult<Arc<dyn DocumentStore>> {
        self.stores
            .get(bucket)
            .cloned()
            .ok_or_else(|| StoreError::InvalidArgument(format!("unknown bucket {}", bucket)))
    }
}

/// Cache of known stores with resolver fallback
pub struct StoreRegistry {
    resolver: Arc<dyn StoreResolver>,
    stores: DashMap<String, Arc<dyn DocumentStore>>,
}

impl StoreRegistry {
    pub fn new(resolver: Arc<dyn StoreResolver>) -> Self {
        Self {
            resolver,
            stores: DashMap::new(),
        }
    }

    /// Remember a store so later lookups of its bucket skip the resolver
    pub fn register(&self, store: &Arc<dyn DocumentStore>) {
        let bucket = store.bucket_name();
        if !self.stores.contains_key(bucket) {
            debug!(bucket, "Registered store");
            self.stores.insert(bucket.to_string(), Arc::clone(store));
        }
    }

    pub fn resolve(&self, bucket: &str) -> StoreResult<Arc<dyn DocumentStore>> {
        if let Some(store) = self.stores.get(bucket) {
            return Ok(Arc::clone(store.value()));
        }
        let store = self.resolver.resolve(bucket)?;
        self.stores
            .insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Buckets registered or resolved so far
    pub fn buckets(&self) -> Vec<String> {
        let mut buckets: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        buckets.sort();
        buckets
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("buckets", &self.buckets())
            .finish()
    }
}
