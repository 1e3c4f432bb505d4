//! Collection handle for plain (non-transactional) document access

use crate::config::defaults::DEFAULT_KV_TIMEOUT;
use crate::config::DurabilityLevel;
use crate::storage::backend::{
    Cas, DocumentStore, GetResult, MutateOptions, MutationResult, ObserveDurability, StoreResult,
};
use crate::storage::op::{duration_to_expiry, KvOp};
use crate::storage::{DocumentId, DocumentLocation};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Write settings applied to every plain mutation through a [`Collection`]
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub durability: DurabilityLevel,
    pub observe: Option<ObserveDurability>,
    /// Document TTL; `None` keeps the document forever
    pub expiry: Option<Duration>,
    /// Overrides the collection's request timeout
    pub timeout: Option<Duration>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityLevel::None,
            observe: None,
            expiry: None,
            timeout: None,
        }
    }
}

/// A scope/collection within one store
#[derive(Debug, Clone)]
pub struct Collection {
    store: Arc<dyn DocumentStore>,
    scope: String,
    name: String,
    timeout: Duration,
    write: WriteOptions,
}

impl Collection {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        scope: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            scope: scope.into(),
            name: name.into(),
            timeout: DEFAULT_KV_TIMEOUT,
            write: WriteOptions::default(),
        }
    }

    /// The `_default` scope and collection of `store`
    pub fn default_collection(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(store, "_default", "_default")
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_write_options(mut self, write: WriteOptions) -> Self {
        self.write = write;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket_name()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> DocumentLocation {
        DocumentLocation::new(self.store.bucket_name(), &self.scope, &self.name)
    }

    pub fn id(&self, key: &str) -> DocumentId {
        self.location().doc(key)
    }

    fn read_op(&self, operation: &'static str, id: &DocumentId) -> KvOp {
        KvOp::new(operation, id, self.timeout)
    }

    fn write_op(&self, operation: &'static str, id: &DocumentId) -> KvOp {
        KvOp::new(operation, id, self.write.timeout.unwrap_or(self.timeout))
            .durability(self.write.durability)
            .observe(self.write.observe)
    }

    fn mutate_options(&self, op: &KvOp, cas: Option<Cas>) -> MutateOptions {
        op.mutate_options(MutateOptions {
            cas,
            expiry: self.write.expiry.map(duration_to_expiry).unwrap_or(0),
            ..Default::default()
        })
    }

    pub async fn get(&self, key: &str) -> StoreResult<GetResult> {
        let id = self.id(key);
        self.read_op("get", &id).run(self.store.get(&id)).await
    }

    pub async fn insert(&self, key: &str, value: Value) -> StoreResult<MutationResult> {
        let id = self.id(key);
        let op = self.write_op("insert", &id);
        let options = self.mutate_options(&op, None);
        op.run_observed(self.store.as_ref(), self.store.insert(&id, value, &options))
            .await
    }

    pub async fn upsert(&self, key: &str, value: Value) -> StoreResult<MutationResult> {
        let id = self.id(key);
        let op = self.write_op("upsert", &id);
        let options = self.mutate_options(&op, None);
        op.run_observed(self.store.as_ref(), self.store.upsert(&id, value, &options))
            .await
    }

    pub async fn replace(
        &self,
        key: &str,
        value: Value,
        cas: Option<Cas>,
    ) -> StoreResult<MutationResult> {
        let id = self.id(key);
        let op = self.write_op("replace", &id);
        let options = self.mutate_options(&op, cas);
        op.run_observed(self.store.as_ref(), self.store.replace(&id, value, &options))
            .await
    }

    pub async fn remove(&self, key: &str, cas: Option<Cas>) -> StoreResult<MutationResult> {
        let id = self.id(key);
        let op = self.write_op("remove", &id);
        let options = self.mutate_options(&op, cas);
        op.run_observed(self.store.as_ref(), self.store.remove(&id, &options))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn collection() -> (Arc<MemoryStore>, Collection) {
        let store = Arc::new(MemoryStore::new("travel"));
        let coll = Collection::new(store.clone(), "inventory", "items");
        (store, coll)
    }

    #[tokio::test]
    async fn test_plain_crud() {
        let (_, coll) = collection();
        coll.insert("a", json!({"n": 1})).await.unwrap();
        let got = coll.get("a").await.unwrap();
        assert_eq!(got.value, json!({"n": 1}));

        coll.replace("a", json!({"n": 2}), Some(got.cas)).await.unwrap();
        assert!(matches!(
            coll.replace("a", json!({"n": 3}), Some(got.cas)).await,
            Err(StoreError::CasMismatch(_))
        ));
        coll.remove("a", None).await.unwrap();
        assert!(matches!(coll.get("a").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ttl_write() {
        let (store, coll) = collection();
        let coll = coll.with_write_options(WriteOptions {
            expiry: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        coll.upsert("ttl", json!(1)).await.unwrap();
        store.advance_clock(Duration::from_secs(6));
        assert!(coll.get("ttl").await.is_err());
    }

    #[tokio::test]
    async fn test_location() {
        let (_, coll) = collection();
        assert_eq!(coll.id("k").to_string(), "travel.inventory.items/k");
        assert_eq!(coll.bucket(), "travel");
    }
}
