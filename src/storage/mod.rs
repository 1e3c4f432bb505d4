//! Storage adapter layer
//!
//! Transactions never talk to a key-value store directly. Everything goes
//! through the [`DocumentStore`] capability contract, which every backing
//! store must provide:
//!
//! - per-document CAS get / insert / replace / remove
//! - partial-document (sub-path) reads and writes, with create-if-absent
//! - metadata paths (xattrs) stored beside the visible body
//! - durability acknowledgment and TTL on write
//!
//! ## Layout
//!
//! ```text
//! Collection ──▶ KvOp (timeout, cancel, durability) ──▶ dyn DocumentStore
//!                                                       ├── MemoryStore
//!                                                       └── (your adapter)
//! StoreRegistry ──▶ StoreResolver   (bucket name -> store, for background work)
//! ```

pub mod backend;
pub mod collection;
pub mod memory;
pub mod op;
pub mod path;
pub mod registry;

pub use backend::{
    Cas, DocumentStore, GetResult, LookupInResult, LookupInSpec, MutateInSpec, MutateOptions,
    MutationResult, ObserveDurability, StoreResult, StoreSemantics,
};
pub use collection::{Collection, WriteOptions};
pub use memory::{Fault, MemoryStore, RawDocument, StoreOperation};
pub use op::{cancellation, duration_to_expiry, CancelHandle, CancelSignal, KvOp};
pub use registry::{NoStoreResolver, StaticResolver, StoreRegistry, StoreResolver};

use serde::{Deserialize, Serialize};

/// A bucket / scope / collection triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentLocation {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl DocumentLocation {
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Location using the default scope and collection of a bucket
    pub fn default_collection(bucket: impl Into<String>) -> Self {
        Self::new(bucket, "_default", "_default")
    }

    /// Identify a document in this location
    pub fn doc(&self, key: impl Into<String>) -> DocumentId {
        DocumentId {
            location: self.clone(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for DocumentLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Fully qualified document identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId {
    pub location: DocumentLocation,
    pub key: String,
}

impl DocumentId {
    pub fn bucket(&self) -> &str {
        &self.location.bucket
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.location, self.key)
    }
}
