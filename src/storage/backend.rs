//! Storage backend trait for transactions
//!
//! [`DocumentStore`] is the seam between the transaction machinery and an
//! actual key-value store. Each document has a visible body and a separate
//! metadata region (xattrs) that transactions use for staging markers and
//! ATR entries. A document whose body is absent but whose metadata survives
//! is a tombstone: invisible to plain reads, reachable with `access_deleted`.

use crate::config::DurabilityLevel;
use crate::error::StoreError;
use crate::storage::DocumentId;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;

/// Compare-and-swap token of a document revision
pub type Cas = u64;

/// Result type for store requests
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Visible document contents
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub value: Value,
    pub cas: Cas,
}

/// Outcome of a successful mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: Cas,
}

/// A single partial read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupInSpec {
    /// Read a path in the body, or in the metadata region when `xattr`
    Get { path: String, xattr: bool },
    /// Read the whole body
    GetDoc,
}

impl LookupInSpec {
    pub fn get(path: impl Into<String>) -> Self {
        Self::Get {
            path: path.into(),
            xattr: false,
        }
    }

    pub fn get_xattr(path: impl Into<String>) -> Self {
        Self::Get {
            path: path.into(),
            xattr: true,
        }
    }
}

/// Result of a partial read, one slot per requested spec
#[derive(Debug, Clone, PartialEq)]
pub struct LookupInResult {
    pub cas: Cas,
    /// The document is a tombstone (body absent)
    pub deleted: bool,
    pub values: Vec<Option<Value>>,
}

impl LookupInResult {
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    pub fn exists(&self, index: usize) -> bool {
        self.value(index).is_some()
    }

    /// Decode the value in `index`, `None` when the path was absent
    pub fn content_as<T: DeserializeOwned>(
        &self,
        index: usize,
    ) -> Result<Option<T>, serde_json::Error> {
        match self.value(index) {
            Some(v) => serde_json::from_value(v.clone()).map(Some),
            None => Ok(None),
        }
    }
}

/// A single partial write
#[derive(Debug, Clone, PartialEq)]
pub enum MutateInSpec {
    /// Create a path, failing if it exists
    Insert {
        path: String,
        value: Value,
        xattr: bool,
        create_path: bool,
    },
    /// Create or overwrite a path
    Upsert {
        path: String,
        value: Value,
        xattr: bool,
        create_path: bool,
    },
    /// Overwrite a path, failing if it is absent
    Replace {
        path: String,
        value: Value,
        xattr: bool,
    },
    /// Remove a path, failing if it is absent
    Remove { path: String, xattr: bool },
    /// Overwrite the whole body
    SetDoc(Value),
    /// Delete the whole document, tombstone included
    DeleteDoc,
}

impl MutateInSpec {
    pub fn insert_xattr(path: impl Into<String>, value: Value) -> Self {
        Self::Insert {
            path: path.into(),
            value,
            xattr: true,
            create_path: true,
        }
    }

    pub fn upsert_xattr(path: impl Into<String>, value: Value) -> Self {
        Self::Upsert {
            path: path.into(),
            value,
            xattr: true,
            create_path: true,
        }
    }

    pub fn replace_xattr(path: impl Into<String>, value: Value) -> Self {
        Self::Replace {
            path: path.into(),
            value,
            xattr: true,
        }
    }

    pub fn remove_xattr(path: impl Into<String>) -> Self {
        Self::Remove {
            path: path.into(),
            xattr: true,
        }
    }
}

/// Document level action taken by `mutate_in`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    /// The document must exist
    #[default]
    Replace,
    /// Create the document if it does not exist
    Upsert,
    /// Create the document, failing if it exists
    Insert,
}

/// Observe-based durability requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserveDurability {
    pub persist_to: u32,
    pub replicate_to: u32,
}

impl ObserveDurability {
    pub fn is_required(&self) -> bool {
        self.persist_to > 0 || self.replicate_to > 0
    }
}

/// Options shared by all mutations
#[derive(Debug, Clone, PartialEq)]
pub struct MutateOptions {
    /// Fail with a CAS mismatch unless the document is at this revision
    pub cas: Option<Cas>,
    pub semantics: StoreSemantics,
    /// Operate on tombstones as well as live documents
    pub access_deleted: bool,
    /// Create the document as a tombstone carrying only metadata
    pub create_as_deleted: bool,
    /// Turn a tombstone back into a live document
    pub revive_document: bool,
    /// Wire expiry, see [`duration_to_expiry`](crate::storage::duration_to_expiry)
    pub expiry: u32,
    pub durability: DurabilityLevel,
    pub durability_timeout: Option<Duration>,
}

impl Default for MutateOptions {
    fn default() -> Self {
        Self {
            cas: None,
            semantics: StoreSemantics::Replace,
            access_deleted: false,
            create_as_deleted: false,
            revive_document: false,
            expiry: 0,
            durability: DurabilityLevel::None,
            durability_timeout: None,
        }
    }
}

impl MutateOptions {
    pub fn with_cas(cas: Cas) -> Self {
        Self {
            cas: Some(cas),
            ..Default::default()
        }
    }
}

/// Capability contract every backing key-value store must provide
///
/// A store handle is scoped to one bucket; scope and collection come from
/// the [`DocumentId`] of each request.
#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    /// Name of the bucket this handle serves
    fn bucket_name(&self) -> &str;

    /// Current store time in unix milliseconds
    ///
    /// ATR timestamps and expiry checks use this clock so that every actor
    /// reaching the same store agrees on elapsed time.
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    /// Read the visible body. Tombstones are reported as not found.
    async fn get(&self, id: &DocumentId) -> StoreResult<GetResult>;

    /// Create a document, failing if a live one exists
    async fn insert(
        &self,
        id: &DocumentId,
        value: Value,
        options: &MutateOptions,
    ) -> StoreResult<MutationResult>;

    /// Create or overwrite a document
    async fn upsert(
        &self,
        id: &DocumentId,
        value: Value,
        options: &MutateOptions,
    ) -> StoreResult<MutationResult>;

    /// Overwrite an existing document, honoring `options.cas`
    async fn replace(
        &self,
        id: &DocumentId,
        value: Value,
        options: &MutateOptions,
    ) -> StoreResult<MutationResult>;

    /// Delete an existing document, honoring `options.cas`
    async fn remove(&self, id: &DocumentId, options: &MutateOptions)
        -> StoreResult<MutationResult>;

    /// Partial read of body and metadata paths
    async fn lookup_in(
        &self,
        id: &DocumentId,
        specs: &[LookupInSpec],
        access_deleted: bool,
    ) -> StoreResult<LookupInResult>;

    /// Partial write of body and metadata paths, applied atomically
    async fn mutate_in(
        &self,
        id: &DocumentId,
        specs: &[MutateInSpec],
        options: &MutateOptions,
    ) -> StoreResult<MutationResult>;

    /// Wait until the revision `cas` satisfies an observe requirement
    async fn observe_durability(
        &self,
        id: &DocumentId,
        cas: Cas,
        requirement: ObserveDurability,
    ) -> StoreResult<()>;
}
