//! Staging markers and attempt-visible document handles
//!
//! A staged document carries a marker in its `txn` metadata path:
//!
//! ```json
//! {
//!   "id":      { "txn": "<transaction id>", "atmpt": "<attempt id>" },
//!   "atr":     { "bkt": "...", "scp": "...", "coll": "...", "key": "_txn:atr-17" },
//!   "op":      { "type": "replace", "stgd": { ... } },
//!   "restore": { "cas": 7 }
//! }
//! ```
//!
//! The visible body is left untouched until the attempt commits.

use crate::atr::{AtrLocation, StagedKind};
use crate::storage::{Cas, DocumentId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata path of the staging marker
pub const MARKER_PATH: &str = "txn";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerIds {
    pub txn: String,
    pub atmpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerOp {
    #[serde(rename = "type")]
    pub kind: StagedKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stgd: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRestore {
    pub cas: Cas,
}

/// Side-channel record of a staged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingMarker {
    pub id: MarkerIds,
    pub atr: AtrLocation,
    pub op: MarkerOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<MarkerRestore>,
}

impl StagingMarker {
    pub fn new(
        transaction_id: &str,
        attempt_id: &str,
        atr: &AtrLocation,
        kind: StagedKind,
        staged: Option<Value>,
        original_cas: Option<Cas>,
    ) -> Self {
        Self {
            id: MarkerIds {
                txn: transaction_id.to_string(),
                atmpt: attempt_id.to_string(),
            },
            atr: atr.clone(),
            op: MarkerOp {
                kind,
                stgd: staged,
            },
            restore: original_cas.map(|cas| MarkerRestore { cas }),
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.id.atmpt
    }

    pub fn transaction_id(&self) -> &str {
        &self.id.txn
    }

    pub fn kind(&self) -> StagedKind {
        self.op.kind
    }
}

/// One mutation staged by an attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StagedMutation {
    pub id: DocumentId,
    pub kind: StagedKind,
    /// Staged content; `None` for removals and for mutations restored from
    /// a snapshot, where the marker holds the content
    pub staged: Option<Value>,
    /// CAS of the document after the marker was written
    pub cas: Cas,
    /// CAS observed when the mutation was staged, `None` for inserts
    pub original_cas: Option<Cas>,
}

/// A document as seen by an attempt
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionGetResult {
    pub id: DocumentId,
    pub value: Value,
    pub cas: Cas,
    /// Marker on the document when it was read
    pub marker: Option<StagingMarker>,
}

impl TransactionGetResult {
    pub fn key(&self) -> &str {
        &self.id.key
    }

    /// Decode the content into `T`
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

/// Outcome of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub attempt_id: String,
    /// False when the commit point was reached but some documents are
    /// still being unstaged in the background
    pub unstaging_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DocumentLocation;
    use serde_json::json;

    #[test]
    fn test_marker_wire_format() {
        let atr = AtrLocation::new(&DocumentLocation::default_collection("b"), "_txn:atr-3");
        let marker = StagingMarker::new("t1", "a1", &atr, StagedKind::Replace, Some(json!({"v": 1})), Some(7));
        let value = serde_json::to_value(&marker).unwrap();
        assert_eq!(
            value,
            json!({
                "id": {"txn": "t1", "atmpt": "a1"},
                "atr": {"bkt": "b", "scp": "_default", "coll": "_default", "key": "_txn:atr-3"},
                "op": {"type": "replace", "stgd": {"v": 1}},
                "restore": {"cas": 7}
            })
        );
        let parsed: StagingMarker = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, marker);
    }

    #[test]
    fn test_remove_marker_omits_content() {
        let atr = AtrLocation::new(&DocumentLocation::default_collection("b"), "_txn:atr-0");
        let marker = StagingMarker::new("t1", "a1", &atr, StagedKind::Remove, None, Some(3));
        let value = serde_json::to_value(&marker).unwrap();
        assert!(value["op"].get("stgd").is_none());
        assert_eq!(marker.kind(), StagedKind::Remove);
    }

    #[test]
    fn test_get_result_content_as() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Item {
            qty: u32,
        }
        let result = TransactionGetResult {
            id: DocumentLocation::default_collection("b").doc("item:42"),
            value: json!({"qty": 3}),
            cas: 9,
            marker: None,
        };
        assert_eq!(result.content_as::<Item>().unwrap(), Item { qty: 3 });
        assert_eq!(result.key(), "item:42");
    }
}
