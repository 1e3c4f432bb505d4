//! Resumable attempt snapshots
//!
//! Wire format (JSON, version 1):
//!
//! ```json
//! {
//!   "version": 1,
//!   "id":        { "txn": "...", "atmpt": "..." },
//!   "atr":       { "bkt": "...", "scp": "...", "coll": "...", "key": "_txn:atr-17" },
//!   "config":    { "kvTimeoutMs": 2500, "durabilityLevel": "MAJORITY", "numAtrs": 1024 },
//!   "state":     { "timeLeftMs": 8000 },
//!   "mutations": [ { "bkt": "...", "scp": "...", "coll": "...", "key": "...", "cas": 7, "type": "replace" } ]
//! }
//! ```
//!
//! Parsing treats every field as optional and then validates strictly, so a
//! missing or out-of-range field fails resumption with a precise reason
//! instead of silently falling back to a default.

use crate::atr::{AtrLocation, StagedKind};
use crate::attempt::Attempt;
use crate::config::{DurabilityLevel, MAX_NUM_ATRS};
use crate::error::{Result, TransactionError};
use crate::storage::{Cas, DocumentId, DocumentLocation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    txn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    atmpt: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireAtr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bkt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coll: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kv_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    durability_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    num_atrs: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_left_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMutation {
    #[serde(default)]
    bkt: Option<String>,
    #[serde(default)]
    scp: Option<String>,
    #[serde(default)]
    coll: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    cas: Option<Cas>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireSnapshot {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    id: Option<WireIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    atr: Option<WireAtr>,
    #[serde(default)]
    config: Option<WireConfig>,
    #[serde(default)]
    state: Option<WireState>,
    #[serde(default)]
    mutations: Option<Vec<WireMutation>>,
}

/// A staged mutation listed in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMutation {
    pub id: DocumentId,
    pub cas: Cas,
    pub kind: StagedKind,
}

/// A validated attempt snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSnapshot {
    pub transaction_id: String,
    pub attempt_id: String,
    pub atr: Option<AtrLocation>,
    pub kv_timeout: Duration,
    pub durability: DurabilityLevel,
    pub num_atrs: u32,
    pub time_left: Duration,
    pub mutations: Vec<SnapshotMutation>,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| TransactionError::invalid_snapshot(format!("missing {}", field)))
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TransactionError::invalid_snapshot(format!("missing {}", field))),
    }
}

impl AttemptSnapshot {
    /// Capture the resumable parts of an attempt
    pub(crate) fn from_attempt(attempt: &Attempt) -> Self {
        Self {
            transaction_id: attempt.transaction_id().to_string(),
            attempt_id: attempt.id().to_string(),
            atr: attempt.atr_location().cloned(),
            kv_timeout: attempt.kv_timeout(),
            durability: attempt.durability(),
            num_atrs: attempt.num_atrs(),
            time_left: attempt.time_left(),
            mutations: attempt
                .mutations()
                .iter()
                .map(|m| SnapshotMutation {
                    id: m.id.clone(),
                    cas: m.cas,
                    kind: m.kind,
                })
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireSnapshot {
            version: Some(SNAPSHOT_VERSION),
            id: Some(WireIds {
                txn: Some(self.transaction_id.clone()),
                atmpt: Some(self.attempt_id.clone()),
            }),
            atr: self.atr.as_ref().map(|atr| WireAtr {
                bkt: Some(atr.bucket.clone()),
                scp: Some(atr.scope.clone()),
                coll: Some(atr.collection.clone()),
                key: Some(atr.key.clone()),
            }),
            config: Some(WireConfig {
                kv_timeout_ms: Some(self.kv_timeout.as_millis() as u64),
                durability_level: Some(self.durability.to_string()),
                num_atrs: Some(self.num_atrs),
            }),
            state: Some(WireState {
                time_left_ms: Some(self.time_left.as_millis() as u64),
            }),
            mutations: Some(
                self.mutations
                    .iter()
                    .map(|m| WireMutation {
                        bkt: Some(m.id.location.bucket.clone()),
                        scp: Some(m.id.location.scope.clone()),
                        coll: Some(m.id.location.collection.clone()),
                        key: Some(m.id.key.clone()),
                        cas: Some(m.cas),
                        kind: Some(m.kind.to_string()),
                    })
                    .collect(),
            ),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parse and validate a snapshot
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: WireSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| TransactionError::invalid_snapshot(format!("malformed JSON: {}", e)))?;

        let version = required(wire.version, "version")?;
        if version != SNAPSHOT_VERSION {
            return Err(TransactionError::invalid_snapshot(format!(
                "unsupported version {}",
                version
            )));
        }

        let ids = required(wire.id, "id")?;
        let transaction_id = non_empty(ids.txn, "transaction id")?;
        let attempt_id = non_empty(ids.atmpt, "attempt id")?;

        let config = required(wire.config, "config")?;
        let durability_name = required(config.durability_level, "durability level")?;
        let durability = durability_name
            .parse::<DurabilityLevel>()
            .map_err(TransactionError::invalid_snapshot)?;
        let kv_timeout_ms = required(config.kv_timeout_ms, "kv timeout")?;
        if kv_timeout_ms == 0 {
            return Err(TransactionError::invalid_snapshot("kv timeout must be > 0"));
        }
        let num_atrs = required(config.num_atrs, "num atrs")?;
        if num_atrs == 0 || num_atrs > MAX_NUM_ATRS {
            return Err(TransactionError::invalid_snapshot(format!(
                "num atrs must be in [1, {}], got {}",
                MAX_NUM_ATRS, num_atrs
            )));
        }

        let state = required(wire.state, "state")?;
        let time_left_ms = required(state.time_left_ms, "time left")?;
        if time_left_ms == 0 {
            return Err(TransactionError::invalid_snapshot("time left must be > 0"));
        }

        let atr = match wire.atr {
            Some(atr) => Some(AtrLocation::new(
                &DocumentLocation::new(
                    non_empty(atr.bkt, "atr bucket")?,
                    non_empty(atr.scp, "atr scope")?,
                    non_empty(atr.coll, "atr collection")?,
                ),
                non_empty(atr.key, "atr key")?,
            )),
            None => None,
        };

        let mut mutations = Vec::new();
        for m in wire.mutations.unwrap_or_default() {
            let location = DocumentLocation::new(
                non_empty(m.bkt, "mutation bucket")?,
                non_empty(m.scp, "mutation scope")?,
                non_empty(m.coll, "mutation collection")?,
            );
            let kind = required(m.kind, "mutation type")?
                .parse::<StagedKind>()
                .map_err(TransactionError::invalid_snapshot)?;
            mutations.push(SnapshotMutation {
                id: location.doc(non_empty(m.key, "mutation key")?),
                cas: required(m.cas, "mutation cas")?,
                kind,
            });
        }
        if !mutations.is_empty() && atr.is_none() {
            return Err(TransactionError::invalid_snapshot(
                "staged mutations without an ATR location",
            ));
        }

        Ok(Self {
            transaction_id,
            attempt_id,
            atr,
            kv_timeout: Duration::from_millis(kv_timeout_ms),
            durability,
            num_atrs,
            time_left: Duration::from_millis(time_left_ms),
            mutations,
        })
    }
}
