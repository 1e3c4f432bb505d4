//! Active Transaction Records
//!
//! An ATR is an ordinary document holding, in its metadata, one sub-entry
//! per active attempt under `attempts.<attempt id>`. Each location has a
//! fixed set of ATR shards; the shard for a transaction is
//! `crc32(transaction id) % num_atrs`, so any actor can recompute where an
//! attempt's entry lives without a directory lookup.
//!
//! Independent attempts hashing to the same shard only ever write their own
//! sub-entry, so they never block each other beyond a CAS retry.

mod state;
mod store;

pub use state::AttemptState;
pub use store::{AtrStore, Transition};

use crate::config::DurabilityLevel;
use crate::storage::{DocumentId, DocumentLocation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metadata path holding every attempt entry of an ATR document
pub const ATTEMPTS_PATH: &str = "attempts";

const ATR_KEY_PREFIX: &str = "_txn:atr-";

/// ATR shard of a transaction
pub fn atr_shard(transaction_id: &str, num_atrs: u32) -> u32 {
    crc32fast::hash(transaction_id.as_bytes()) % num_atrs.max(1)
}

/// Document key of an ATR shard
pub fn atr_key(shard: u32) -> String {
    format!("{}{}", ATR_KEY_PREFIX, shard)
}

/// Metadata path of one attempt's entry
pub fn entry_path(attempt_id: &str) -> String {
    format!("{}.{}", ATTEMPTS_PATH, attempt_id)
}

/// Where an attempt's ATR entry lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtrLocation {
    #[serde(rename = "bkt")]
    pub bucket: String,
    #[serde(rename = "scp")]
    pub scope: String,
    #[serde(rename = "coll")]
    pub collection: String,
    pub key: String,
}

impl AtrLocation {
    pub fn new(location: &DocumentLocation, key: impl Into<String>) -> Self {
        Self {
            bucket: location.bucket.clone(),
            scope: location.scope.clone(),
            collection: location.collection.clone(),
            key: key.into(),
        }
    }

    /// The shard document for `transaction_id` in `location`
    pub fn for_transaction(location: &DocumentLocation, transaction_id: &str, num_atrs: u32) -> Self {
        Self::new(location, atr_key(atr_shard(transaction_id, num_atrs)))
    }

    pub fn location(&self) -> DocumentLocation {
        DocumentLocation::new(&self.bucket, &self.scope, &self.collection)
    }

    pub fn document_id(&self) -> DocumentId {
        self.location().doc(&self.key)
    }
}

impl fmt::Display for AtrLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}/{}", self.bucket, self.scope, self.collection, self.key)
    }
}

/// Kind of a staged mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedKind {
    Insert,
    Replace,
    Remove,
}

impl fmt::Display for StagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagedKind::Insert => write!(f, "insert"),
            StagedKind::Replace => write!(f, "replace"),
            StagedKind::Remove => write!(f, "remove"),
        }
    }
}

impl FromStr for StagedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(StagedKind::Insert),
            "replace" => Ok(StagedKind::Replace),
            "remove" => Ok(StagedKind::Remove),
            other => Err(format!("unknown mutation type '{}'", other)),
        }
    }
}

/// Reference to a staged document inside an ATR entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRef {
    #[serde(rename = "bkt")]
    pub bucket: String,
    #[serde(rename = "scp")]
    pub scope: String,
    #[serde(rename = "col")]
    pub collection: String,
    #[serde(rename = "id")]
    pub key: String,
}

impl From<&DocumentId> for DocRef {
    fn from(id: &DocumentId) -> Self {
        Self {
            bucket: id.location.bucket.clone(),
            scope: id.location.scope.clone(),
            collection: id.location.collection.clone(),
            key: id.key.clone(),
        }
    }
}

impl DocRef {
    pub fn document_id(&self) -> DocumentId {
        DocumentLocation::new(&self.bucket, &self.scope, &self.collection).doc(&self.key)
    }
}

/// One attempt's sub-entry of an ATR document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrEntry {
    #[serde(rename = "tid")]
    pub transaction_id: String,

    #[serde(rename = "st")]
    pub state: AttemptState,

    /// Store time the entry was created, unix ms
    #[serde(rename = "tst")]
    pub started_ms: u64,

    /// Remaining attempt lifetime at `started_ms`
    #[serde(rename = "exp")]
    pub expires_after_ms: u64,

    #[serde(rename = "tsc", default, skip_serializing_if = "Option::is_none")]
    pub commit_started_ms: Option<u64>,

    #[serde(rename = "tsco", default, skip_serializing_if = "Option::is_none")]
    pub commit_completed_ms: Option<u64>,

    #[serde(rename = "tsrs", default, skip_serializing_if = "Option::is_none")]
    pub rollback_started_ms: Option<u64>,

    #[serde(rename = "tsrc", default, skip_serializing_if = "Option::is_none")]
    pub rollback_completed_ms: Option<u64>,

    #[serde(rename = "ins", default)]
    pub inserted: Vec<DocRef>,

    #[serde(rename = "rep", default)]
    pub replaced: Vec<DocRef>,

    #[serde(rename = "rem", default)]
    pub removed: Vec<DocRef>,

    /// Durability level in short form
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<String>,
}

impl AtrEntry {
    pub fn new(
        transaction_id: impl Into<String>,
        started_ms: u64,
        expires_after_ms: u64,
        durability: DurabilityLevel,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            state: AttemptState::Staged,
            started_ms,
            expires_after_ms,
            commit_started_ms: None,
            commit_completed_ms: None,
            rollback_started_ms: None,
            rollback_completed_ms: None,
            inserted: Vec::new(),
            replaced: Vec::new(),
            removed: Vec::new(),
            durability: Some(durability.as_short().to_string()),
        }
    }

    /// Whether the attempt is past its expiry at store time `now_ms`
    pub fn has_expired(&self, now_ms: u64) -> bool {
        now_ms > self.started_ms.saturating_add(self.expires_after_ms)
    }

    pub fn durability_level(&self) -> DurabilityLevel {
        self.durability
            .as_deref()
            .and_then(DurabilityLevel::from_short)
            .unwrap_or_default()
    }

    /// Record a staged document; returns false if it was already listed
    /// under `kind`
    pub fn add_doc(&mut self, kind: StagedKind, doc: DocRef) -> bool {
        if self.docs().any(|(k, d)| k == kind && *d == doc) {
            return false;
        }
        // A restage under another kind moves the reference.
        self.inserted.retain(|d| *d != doc);
        self.replaced.retain(|d| *d != doc);
        self.removed.retain(|d| *d != doc);
        self.list_mut(kind).push(doc);
        true
    }

    fn list_mut(&mut self, kind: StagedKind) -> &mut Vec<DocRef> {
        match kind {
            StagedKind::Insert => &mut self.inserted,
            StagedKind::Replace => &mut self.replaced,
            StagedKind::Remove => &mut self.removed,
        }
    }

    /// Every staged document with its kind
    pub fn docs(&self) -> impl Iterator<Item = (StagedKind, &DocRef)> {
        self.inserted
            .iter()
            .map(|d| (StagedKind::Insert, d))
            .chain(self.replaced.iter().map(|d| (StagedKind::Replace, d)))
            .chain(self.removed.iter().map(|d| (StagedKind::Remove, d)))
    }

    /// Stamp the timestamp belonging to `state`
    pub fn stamp(&mut self, state: AttemptState, now_ms: u64) {
        self.state = state;
        match state {
            AttemptState::Committing => self.commit_started_ms = Some(now_ms),
            AttemptState::Committed => self.commit_completed_ms = Some(now_ms),
            AttemptState::RollingBack => self.rollback_started_ms = Some(now_ms),
            AttemptState::RolledBack => self.rollback_completed_ms = Some(now_ms),
            AttemptState::Pending | AttemptState::Staged => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shard_is_deterministic_and_bounded() {
        let a = atr_shard("txn-1", 1024);
        assert_eq!(a, atr_shard("txn-1", 1024));
        assert!(a < 1024);
        assert_eq!(atr_shard("anything", 1), 0);
        assert_eq!(atr_key(7), "_txn:atr-7");
    }

    #[test]
    fn test_location_for_transaction() {
        let loc = DocumentLocation::new("travel", "inventory", "items");
        let atr = AtrLocation::for_transaction(&loc, "txn-1", 16);
        assert_eq!(atr.key, atr_key(atr_shard("txn-1", 16)));
        assert_eq!(atr.location(), loc);
        assert_eq!(atr.document_id().key, atr.key);
    }

    #[test]
    fn test_entry_wire_format() {
        let mut entry = AtrEntry::new("t1", 1_000, 10_000, DurabilityLevel::Majority);
        let doc = DocRef::from(&DocumentLocation::default_collection("b").doc("k"));
        assert!(entry.add_doc(StagedKind::Replace, doc.clone()));
        assert!(!entry.add_doc(StagedKind::Replace, doc.clone()));

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["tid"], json!("t1"));
        assert_eq!(value["st"], json!("STAGED"));
        assert_eq!(value["rep"][0]["id"], json!("k"));
        assert_eq!(value["d"], json!("m"));
        assert!(value.get("tsc").is_none());

        let parsed: AtrEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_restage_moves_reference() {
        let mut entry = AtrEntry::new("t1", 0, 1, DurabilityLevel::None);
        let doc = DocRef::from(&DocumentLocation::default_collection("b").doc("k"));
        entry.add_doc(StagedKind::Insert, doc.clone());
        entry.add_doc(StagedKind::Remove, doc);
        let kinds: Vec<_> = entry.docs().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![StagedKind::Remove]);
    }

    #[test]
    fn test_expiry_uses_store_time() {
        let entry = AtrEntry::new("t1", 1_000, 500, DurabilityLevel::None);
        assert!(!entry.has_expired(1_500));
        assert!(entry.has_expired(1_501));
    }

    #[test]
    fn test_stamp_sets_matching_timestamp() {
        let mut entry = AtrEntry::new("t1", 0, 1, DurabilityLevel::None);
        entry.stamp(AttemptState::Committing, 42);
        assert_eq!(entry.state, AttemptState::Committing);
        assert_eq!(entry.commit_started_ms, Some(42));
        assert_eq!(entry.rollback_started_ms, None);
    }
}
