//! In-memory document store
//!
//! Implements the whole [`DocumentStore`] contract over a `DashMap`, with the
//! knobs tests need to reproduce distributed failure modes:
//!
//! - a store clock that can be advanced to expire attempts without sleeping
//! - injected latency, so client timeouts and cancellation can fire mid-request
//! - injected faults per operation (optionally per key)
//! - a configurable replica count for durability checks

use crate::config::DurabilityLevel;
use crate::error::StoreError;
use crate::storage::backend::{
    Cas, DocumentStore, GetResult, LookupInResult, LookupInSpec, MutateInSpec, MutateOptions,
    MutationResult, ObserveDurability, StoreResult, StoreSemantics,
};
use crate::storage::path::{self, PathError};
use crate::storage::DocumentId;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Relative expiries above this many seconds are absolute unix timestamps
const RELATIVE_EXPIRY_LIMIT_SECS: u32 = 30 * 24 * 60 * 60;

type DocKey = (String, String, String);

#[derive(Debug, Clone)]
struct StoredDocument {
    body: Option<Value>,
    xattrs: Value,
    cas: Cas,
    expires_at_ms: Option<u64>,
}

impl StoredDocument {
    fn is_tombstone(&self) -> bool {
        self.body.is_none()
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|t| now_ms >= t)
    }
}

/// A raw view of a stored document, metadata included
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub body: Option<Value>,
    pub xattrs: Value,
    pub cas: Cas,
}

/// Store request kinds, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Get,
    Insert,
    Upsert,
    Replace,
    Remove,
    LookupIn,
    MutateIn,
    Observe,
}

/// An injected failure
#[derive(Debug, Clone)]
pub struct Fault {
    pub operation: StoreOperation,
    /// Only requests for this key fail; `None` matches every key
    pub key: Option<String>,
    pub error: StoreError,
    /// Number of matching requests that fail before the fault is removed
    pub remaining: u32,
}

impl Fault {
    pub fn once(operation: StoreOperation, error: StoreError) -> Self {
        Self {
            operation,
            key: None,
            error,
            remaining: 1,
        }
    }

    pub fn for_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn times(mut self, remaining: u32) -> Self {
        self.remaining = remaining;
        self
    }
}

/// In-memory [`DocumentStore`] for one bucket
#[derive(Debug)]
pub struct MemoryStore {
    bucket: String,
    docs: DashMap<DocKey, StoredDocument>,
    next_cas: AtomicU64,
    clock_offset_ms: AtomicI64,
    latency_ms: AtomicU64,
    replicas: u32,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self::with_replicas(bucket, 1)
    }

    /// Create a store whose durability checks assume `replicas` copies
    pub fn with_replicas(bucket: impl Into<String>, replicas: u32) -> Self {
        Self {
            bucket: bucket.into(),
            docs: DashMap::new(),
            next_cas: AtomicU64::new(1),
            clock_offset_ms: AtomicI64::new(0),
            latency_ms: AtomicU64::new(0),
            replicas,
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Move the store clock forward
    pub fn advance_clock(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Delay every request by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Inspect a document including tombstones and metadata
    pub fn raw_document(&self, id: &DocumentId) -> Option<RawDocument> {
        let now = self.now_ms();
        self.docs
            .get(&doc_key(id))
            .filter(|d| !d.is_expired(now))
            .map(|d| RawDocument {
                body: d.body.clone(),
                xattrs: d.xattrs.clone(),
                cas: d.cas,
            })
    }

    /// Number of stored documents, tombstones included
    pub fn document_count(&self) -> usize {
        self.docs.len()
    }

    /// Keys stored in one scope/collection, sorted
    pub fn keys(&self, scope: &str, collection: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .docs
            .iter()
            .filter(|e| e.key().0 == scope && e.key().1 == collection)
            .map(|e| e.key().2.clone())
            .collect();
        keys.sort();
        keys
    }

    fn next_cas(&self) -> Cas {
        self.next_cas.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn simulate(&self, operation: StoreOperation, id: &DocumentId) -> StoreResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if id.location.bucket != self.bucket {
            return Err(StoreError::InvalidArgument(format!(
                "document {} does not belong to bucket {}",
                id, self.bucket
            )));
        }

        let mut faults = self.faults.lock();
        let hit = faults.iter().position(|f| {
            f.operation == operation && f.key.as_deref().map_or(true, |k| k == id.key)
        });
        if let Some(idx) = hit {
            let error = faults[idx].error.clone();
            faults[idx].remaining = faults[idx].remaining.saturating_sub(1);
            if faults[idx].remaining == 0 {
                faults.remove(idx);
            }
            trace!(?operation, key = %id.key, %error, "Injected store fault");
            return Err(error);
        }
        Ok(())
    }

    fn check_durability(
        &self,
        level: DurabilityLevel,
        timeout: Option<Duration>,
    ) -> StoreResult<()> {
        if !level.is_durable() {
            return Ok(());
        }
        if timeout.is_none() {
            return Err(StoreError::InvalidArgument(
                "durable write without a durability timeout".to_string(),
            ));
        }
        if self.replicas == 0 {
            return Err(StoreError::DurabilityImpossible(format!(
                "{} requires at least one replica",
                level
            )));
        }
        Ok(())
    }

    fn decode_expiry(&self, expiry: u32) -> Option<u64> {
        match expiry {
            0 => None,
            secs if secs < RELATIVE_EXPIRY_LIMIT_SECS => {
                Some(self.now_ms() + u64::from(secs) * 1000)
            }
            unix_secs => Some(u64::from(unix_secs) * 1000),
        }
    }

    fn purge_expired(&self, key: &DocKey) {
        let now = self.now_ms();
        self.docs.remove_if(key, |_, d| d.is_expired(now));
    }

    fn write_full(
        &self,
        id: &DocumentId,
        value: Value,
        options: &MutateOptions,
        semantics: StoreSemantics,
    ) -> StoreResult<MutationResult> {
        self.check_durability(options.durability, options.durability_timeout)?;
        let key = doc_key(id);
        self.purge_expired(&key);
        let expires_at_ms = self.decode_expiry(options.expiry);

        match self.docs.entry(key) {
            Entry::Occupied(mut occupied) => {
                let doc = occupied.get_mut();
                let live = !doc.is_tombstone();
                match semantics {
                    StoreSemantics::Insert if live => {
                        return Err(StoreError::Exists(id.key.clone()))
                    }
                    StoreSemantics::Replace if !live => {
                        return Err(StoreError::NotFound(id.key.clone()))
                    }
                    _ => {}
                }
                if let Some(cas) = options.cas {
                    if !live {
                        return Err(StoreError::NotFound(id.key.clone()));
                    }
                    if cas != doc.cas {
                        return Err(StoreError::CasMismatch(id.key.clone()));
                    }
                }
                // Full-body writes drop every metadata path.
                *doc = StoredDocument {
                    body: Some(value),
                    xattrs: Value::Object(Map::new()),
                    cas: self.next_cas(),
                    expires_at_ms,
                };
                Ok(MutationResult { cas: doc.cas })
            }
            Entry::Vacant(vacant) => {
                if semantics == StoreSemantics::Replace || options.cas.is_some() {
                    return Err(StoreError::NotFound(id.key.clone()));
                }
                let cas = self.next_cas();
                vacant.insert(StoredDocument {
                    body: Some(value),
                    xattrs: Value::Object(Map::new()),
                    cas,
                    expires_at_ms,
                });
                Ok(MutationResult { cas })
            }
        }
    }
}

fn doc_key(id: &DocumentId) -> DocKey {
    (
        id.location.scope.clone(),
        id.location.collection.clone(),
        id.key.clone(),
    )
}

fn path_error(err: PathError) -> StoreError {
    match err {
        PathError::NotFound(p) => StoreError::PathNotFound(p),
        PathError::Exists(p) => StoreError::PathExists(p),
        PathError::Invalid(p) => StoreError::InvalidArgument(format!("invalid path {}", p)),
    }
}

/// Apply specs to a working copy; `Ok(true)` means the document is deleted
fn apply_specs(doc: &mut StoredDocument, specs: &[MutateInSpec]) -> StoreResult<bool> {
    for spec in specs {
        match spec {
            MutateInSpec::SetDoc(value) => doc.body = Some(value.clone()),
            MutateInSpec::DeleteDoc => return Ok(true),
            MutateInSpec::Insert {
                path,
                value,
                xattr,
                create_path,
            } => {
                let target = target_mut(doc, *xattr)?;
                path::insert_path(target, path, value.clone(), *create_path).map_err(path_error)?;
            }
            MutateInSpec::Upsert {
                path,
                value,
                xattr,
                create_path,
            } => {
                let target = target_mut(doc, *xattr)?;
                path::upsert_path(target, path, value.clone(), *create_path).map_err(path_error)?;
            }
            MutateInSpec::Replace { path, value, xattr } => {
                let target = target_mut(doc, *xattr)?;
                path::replace_path(target, path, value.clone()).map_err(path_error)?;
            }
            MutateInSpec::Remove { path, xattr } => {
                let target = target_mut(doc, *xattr)?;
                path::remove_path(target, path).map_err(path_error)?;
            }
        }
    }
    Ok(false)
}

fn target_mut(doc: &mut StoredDocument, xattr: bool) -> StoreResult<&mut Value> {
    if xattr {
        return Ok(&mut doc.xattrs);
    }
    doc.body.as_mut().ok_or_else(|| {
        StoreError::InvalidArgument("body paths are not accessible on a tombstone".to_string())
    })
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    fn now_ms(&self) -> u64 {
        let wall = chrono::Utc::now().timestamp_millis();
        (wall + self.clock_offset_ms.load(Ordering::SeqCst)).max(0) as u64
    }

    async fn get(&self, id: &DocumentId) -> StoreResult<GetResult> {
        self.simulate(StoreOperation::Get, id).await?;
        let now = self.now_ms();
        self.docs
            .get(&doc_key(id))
            .filter(|d| !d.is_expired(now))
            .and_then(|d| {
                d.body.clone().map(|value| GetResult {
                    value,
                    cas: d.cas,
                })
            })
            .ok_or_else(|| StoreError::NotFound(id.key.clone()))
    }

    async fn insert(
        &self,
        id: &DocumentId,
        value: Value,
        options: &MutateOptions,
    ) -> StoreResult<MutationResult> {
        self.simulate(StoreOperation::Insert, id).await?;
        self.write_full(id, value, options, StoreSemantics::Insert)
    }

    async fn upsert(
        &self,
        id: &DocumentId,
        value: Value,
        options: &MutateOptions,
    ) -> StoreResult<MutationResult> {
        self.simulate(StoreOperation::Upsert, id).await?;
        self.write_full(id, value, options, StoreSemantics::Upsert)
    }

    async fn replace(
        &self,
        id: &DocumentId,
        value: Value,
        options: &MutateOptions,
    ) -> StoreResult<MutationResult> {
        self.simulate(StoreOperation::Replace, id).await?;
        self.write_full(id, value, options, StoreSemantics::Replace)
    }

    async fn remove(
        &self,
        id: &DocumentId,
        options: &MutateOptions,
    ) -> StoreResult<MutationResult> {
        self.simulate(StoreOperation::Remove, id).await?;
        self.check_durability(options.durability, options.durability_timeout)?;
        let key = doc_key(id);
        self.purge_expired(&key);

        match self.docs.entry(key) {
            Entry::Occupied(occupied) => {
                let doc = occupied.get();
                if doc.is_tombstone() && !options.access_deleted {
                    return Err(StoreError::NotFound(id.key.clone()));
                }
                if options.cas.is_some_and(|cas| cas != doc.cas) {
                    return Err(StoreError::CasMismatch(id.key.clone()));
                }
                occupied.remove();
                Ok(MutationResult {
                    cas: self.next_cas(),
                })
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(id.key.clone())),
        }
    }

    async fn lookup_in(
        &self,
        id: &DocumentId,
        specs: &[LookupInSpec],
        access_deleted: bool,
    ) -> StoreResult<LookupInResult> {
        self.simulate(StoreOperation::LookupIn, id).await?;
        let now = self.now_ms();
        let doc = self
            .docs
            .get(&doc_key(id))
            .filter(|d| !d.is_expired(now))
            .filter(|d| access_deleted || !d.is_tombstone())
            .map(|d| d.clone())
            .ok_or_else(|| StoreError::NotFound(id.key.clone()))?;

        let values = specs
            .iter()
            .map(|spec| match spec {
                LookupInSpec::GetDoc => doc.body.clone(),
                LookupInSpec::Get { path, xattr: true } => {
                    path::get_path(&doc.xattrs, path).cloned()
                }
                LookupInSpec::Get { path, xattr: false } => doc
                    .body
                    .as_ref()
                    .and_then(|b| path::get_path(b, path).cloned()),
            })
            .collect();

        Ok(LookupInResult {
            cas: doc.cas,
            deleted: doc.is_tombstone(),
            values,
        })
    }

    async fn mutate_in(
        &self,
        id: &DocumentId,
        specs: &[MutateInSpec],
        options: &MutateOptions,
    ) -> StoreResult<MutationResult> {
        self.simulate(StoreOperation::MutateIn, id).await?;
        self.check_durability(options.durability, options.durability_timeout)?;
        let key = doc_key(id);
        self.purge_expired(&key);
        let expires_at_ms = self.decode_expiry(options.expiry);

        let fresh = |create_as_deleted: bool| StoredDocument {
            body: if create_as_deleted {
                None
            } else {
                Some(Value::Object(Map::new()))
            },
            xattrs: Value::Object(Map::new()),
            cas: 0,
            expires_at_ms,
        };

        match self.docs.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                let visible = options.access_deleted || !existing.is_tombstone();

                let mut working = if visible {
                    if options.semantics == StoreSemantics::Insert {
                        return Err(StoreError::Exists(id.key.clone()));
                    }
                    if options.cas.is_some_and(|cas| cas != existing.cas) {
                        return Err(StoreError::CasMismatch(id.key.clone()));
                    }
                    let mut working = existing.clone();
                    working.expires_at_ms = expires_at_ms;
                    if options.revive_document && working.is_tombstone() {
                        working.body = Some(Value::Object(Map::new()));
                    }
                    working
                } else {
                    // A hidden tombstone behaves as an absent document.
                    if options.semantics == StoreSemantics::Replace || options.cas.is_some() {
                        return Err(StoreError::NotFound(id.key.clone()));
                    }
                    fresh(options.create_as_deleted)
                };

                if apply_specs(&mut working, specs)? {
                    occupied.remove();
                    return Ok(MutationResult {
                        cas: self.next_cas(),
                    });
                }
                working.cas = self.next_cas();
                let cas = working.cas;
                occupied.insert(working);
                Ok(MutationResult { cas })
            }
            Entry::Vacant(vacant) => {
                if options.semantics == StoreSemantics::Replace || options.cas.is_some() {
                    return Err(StoreError::NotFound(id.key.clone()));
                }
                let mut working = fresh(options.create_as_deleted);
                if apply_specs(&mut working, specs)? {
                    return Err(StoreError::NotFound(id.key.clone()));
                }
                working.cas = self.next_cas();
                let cas = working.cas;
                vacant.insert(working);
                Ok(MutationResult { cas })
            }
        }
    }

    async fn observe_durability(
        &self,
        id: &DocumentId,
        cas: Cas,
        requirement: ObserveDurability,
    ) -> StoreResult<()> {
        self.simulate(StoreOperation::Observe, id).await?;
        if requirement.replicate_to > self.replicas || requirement.persist_to > self.replicas + 1 {
            return Err(StoreError::DurabilityImpossible(format!(
                "replicate_to={} persist_to={} with {} replica(s)",
                requirement.replicate_to, requirement.persist_to, self.replicas
            )));
        }
        match self.docs.get(&doc_key(id)) {
            Some(doc) if doc.cas != cas => Err(StoreError::CasMismatch(id.key.clone())),
            // Removals are observed as the document being gone.
            _ => Ok(()),
        }
    }
}
