//! Resolving a single staged document
//!
//! Shared by an attempt's own commit/rollback and by cleanup. Every write is
//! CAS-guarded against the revision that still carries this attempt's
//! marker, so replaying a step after another actor finished it is a no-op.

use crate::atr::StagedKind;
use crate::attempt::marker::{StagingMarker, MARKER_PATH};
use crate::config::DurabilityLevel;
use crate::error::{Result, StoreError, TransactionError};
use crate::storage::{
    Cas, CancelSignal, DocumentId, DocumentStore, KvOp, LookupInSpec, MutateInSpec, MutateOptions,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_UNSTAGE_RETRIES: usize = 8;

/// Result of resolving one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnstageOutcome {
    /// This call applied or discarded the staged mutation
    Applied,
    /// The document no longer carries this attempt's marker
    Skipped,
}

#[derive(Debug, Clone)]
pub(crate) struct Unstager {
    kv_timeout: Duration,
    durability: DurabilityLevel,
    cancel: Option<CancelSignal>,
}

impl Unstager {
    pub(crate) fn new(
        kv_timeout: Duration,
        durability: DurabilityLevel,
        cancel: Option<CancelSignal>,
    ) -> Self {
        Self {
            kv_timeout,
            durability,
            cancel,
        }
    }

    fn op(&self, operation: &'static str, id: &DocumentId) -> KvOp {
        KvOp::new(operation, id, self.kv_timeout)
            .durability(self.durability)
            .cancel(self.cancel.as_ref())
    }

    /// The marker and CAS of `id` if the marker belongs to `attempt_id`
    async fn owned_marker(
        &self,
        store: &dyn DocumentStore,
        id: &DocumentId,
        attempt_id: &str,
    ) -> Result<Option<(StagingMarker, Cas)>> {
        let specs = [LookupInSpec::get_xattr(MARKER_PATH)];
        let result = KvOp::new("unstage_lookup", id, self.kv_timeout)
            .cancel(self.cancel.as_ref())
            .run(store.lookup_in(id, &specs, true))
            .await;
        let res = match result {
            Ok(res) => res,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(res
            .content_as::<StagingMarker>(0)
            .ok()
            .flatten()
            .filter(|m| m.attempt_id() == attempt_id)
            .map(|m| (m, res.cas)))
    }

    /// Make the staged mutation on `id` visible and clear its marker
    pub(crate) async fn commit_doc(
        &self,
        store: &dyn DocumentStore,
        id: &DocumentId,
        attempt_id: &str,
        staged: Option<&Value>,
    ) -> Result<UnstageOutcome> {
        for _ in 0..MAX_UNSTAGE_RETRIES {
            let Some((marker, cas)) = self.owned_marker(store, id, attempt_id).await? else {
                debug!(key = %id.key, attempt_id, "Document already unstaged");
                return Ok(UnstageOutcome::Skipped);
            };

            let result = match marker.kind() {
                StagedKind::Insert | StagedKind::Replace => {
                    let content = marker
                        .op
                        .stgd
                        .clone()
                        .or_else(|| staged.cloned())
                        .ok_or_else(|| {
                            TransactionError::Internal(format!(
                                "no staged content for {} in attempt {}",
                                id, attempt_id
                            ))
                        })?;
                    let specs = [
                        MutateInSpec::remove_xattr(MARKER_PATH),
                        MutateInSpec::SetDoc(content),
                    ];
                    let op = self.op("commit_doc", id);
                    let options = op.mutate_options(MutateOptions {
                        cas: Some(cas),
                        access_deleted: true,
                        revive_document: marker.kind() == StagedKind::Insert,
                        ..Default::default()
                    });
                    op.run(store.mutate_in(id, &specs, &options)).await
                }
                StagedKind::Remove => {
                    let op = self.op("commit_remove", id);
                    let options = op.mutate_options(MutateOptions::with_cas(cas));
                    op.run(store.remove(id, &options)).await
                }
            };

            match result {
                Ok(_) => {
                    debug!(key = %id.key, attempt_id, kind = %marker.kind(), "Committed document");
                    return Ok(UnstageOutcome::Applied);
                }
                Err(StoreError::CasMismatch(_)) => continue,
                Err(StoreError::NotFound(_)) => return Ok(UnstageOutcome::Skipped),
                Err(e) => return Err(e.into()),
            }
        }
        warn!(key = %id.key, attempt_id, "Document kept changing during commit");
        Err(StoreError::CasMismatch(id.key.clone()).into())
    }

    /// Discard the staged mutation on `id`, deleting staged inserts
    pub(crate) async fn rollback_doc(
        &self,
        store: &dyn DocumentStore,
        id: &DocumentId,
        attempt_id: &str,
    ) -> Result<UnstageOutcome> {
        for _ in 0..MAX_UNSTAGE_RETRIES {
            let Some((marker, cas)) = self.owned_marker(store, id, attempt_id).await? else {
                debug!(key = %id.key, attempt_id, "Document already rolled back");
                return Ok(UnstageOutcome::Skipped);
            };

            let specs = match marker.kind() {
                StagedKind::Insert => [MutateInSpec::DeleteDoc],
                StagedKind::Replace | StagedKind::Remove => [MutateInSpec::remove_xattr(MARKER_PATH)],
            };
            let op = self.op("rollback_doc", id);
            let options = op.mutate_options(MutateOptions {
                cas: Some(cas),
                access_deleted: true,
                ..Default::default()
            });
            match op.run(store.mutate_in(id, &specs, &options)).await {
                Ok(_) => {
                    debug!(key = %id.key, attempt_id, kind = %marker.kind(), "Rolled back document");
                    return Ok(UnstageOutcome::Applied);
                }
                Err(StoreError::CasMismatch(_)) => continue,
                Err(StoreError::NotFound(_)) => return Ok(UnstageOutcome::Skipped),
                Err(e) => return Err(e.into()),
            }
        }
        warn!(key = %id.key, attempt_id, "Document kept changing during rollback");
        Err(StoreError::CasMismatch(id.key.clone()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::AtrLocation;
    use crate::storage::{DocumentLocation, MemoryStore, StoreSemantics};
    use serde_json::json;

    fn unstager() -> Unstager {
        Unstager::new(Duration::from_secs(2), DurabilityLevel::None, None)
    }

    fn marker(kind: StagedKind, staged: Option<Value>) -> Value {
        let atr = AtrLocation::new(&DocumentLocation::default_collection("b"), "_txn:atr-0");
        serde_json::to_value(StagingMarker::new("t1", "a1", &atr, kind, staged, None)).unwrap()
    }

    async fn stage(store: &MemoryStore, id: &DocumentId, kind: StagedKind, staged: Option<Value>) {
        let options = MutateOptions {
            semantics: if kind == StagedKind::Insert {
                StoreSemantics::Insert
            } else {
                StoreSemantics::Replace
            },
            access_deleted: true,
            create_as_deleted: kind == StagedKind::Insert,
            ..Default::default()
        };
        store
            .mutate_in(id, &[MutateInSpec::upsert_xattr(MARKER_PATH, marker(kind, staged))], &options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_insert_revives_document() {
        let store = MemoryStore::new("b");
        let id = DocumentLocation::default_collection("b").doc("new");
        stage(&store, &id, StagedKind::Insert, Some(json!({"a": 1}))).await;

        let outcome = unstager().commit_doc(&store, &id, "a1", None).await.unwrap();
        assert_eq!(outcome, UnstageOutcome::Applied);
        assert_eq!(store.get(&id).await.unwrap().value, json!({"a": 1}));
        assert_eq!(store.raw_document(&id).unwrap().xattrs, json!({}));

        let again = unstager().commit_doc(&store, &id, "a1", None).await.unwrap();
        assert_eq!(again, UnstageOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_commit_remove_deletes_document() {
        let store = MemoryStore::new("b");
        let id = DocumentLocation::default_collection("b").doc("gone");
        store.insert(&id, json!(1), &MutateOptions::default()).await.unwrap();
        stage(&store, &id, StagedKind::Remove, None).await;

        unstager().commit_doc(&store, &id, "a1", None).await.unwrap();
        assert!(store.raw_document(&id).is_none());
    }

    #[tokio::test]
    async fn test_rollback_restores_visible_state() {
        let store = MemoryStore::new("b");
        let loc = DocumentLocation::default_collection("b");
        let replaced = loc.doc("replaced");
        let inserted = loc.doc("inserted");
        store
            .insert(&replaced, json!({"v": "old"}), &MutateOptions::default())
            .await
            .unwrap();
        stage(&store, &replaced, StagedKind::Replace, Some(json!({"v": "new"}))).await;
        stage(&store, &inserted, StagedKind::Insert, Some(json!({"v": 1}))).await;

        unstager().rollback_doc(&store, &replaced, "a1").await.unwrap();
        unstager().rollback_doc(&store, &inserted, "a1").await.unwrap();

        let raw = store.raw_document(&replaced).unwrap();
        assert_eq!(raw.body, Some(json!({"v": "old"})));
        assert_eq!(raw.xattrs, json!({}));
        assert!(store.raw_document(&inserted).is_none());
    }

    #[tokio::test]
    async fn test_foreign_marker_is_left_alone() {
        let store = MemoryStore::new("b");
        let id = DocumentLocation::default_collection("b").doc("k");
        store.insert(&id, json!(1), &MutateOptions::default()).await.unwrap();
        stage(&store, &id, StagedKind::Replace, Some(json!(2))).await;

        let outcome = unstager().rollback_doc(&store, &id, "other").await.unwrap();
        assert_eq!(outcome, UnstageOutcome::Skipped);
        assert!(store.raw_document(&id).unwrap().xattrs.get(MARKER_PATH).is_some());
    }
}
