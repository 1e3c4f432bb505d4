//! CAS-guarded access to ATR documents

use crate::atr::{entry_path, AtrEntry, AtrLocation, AttemptState, DocRef, StagedKind, ATTEMPTS_PATH};
use crate::config::DurabilityLevel;
use crate::error::{Result, StoreError, TransactionError};
use crate::storage::{
    CancelSignal, DocumentId, DocumentStore, KvOp, LookupInSpec, MutateInSpec, MutateOptions,
    StoreSemantics,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on re-reads after losing a CAS race on a busy shard
const MAX_CAS_RETRIES: usize = 32;

/// Outcome of a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The entry is now in the requested state
    Applied(AtrEntry),
    /// Another actor moved the entry to this state first
    Lost(AttemptState),
    /// The entry no longer exists
    Missing,
}

/// Reads and writes one ATR shard document
#[derive(Debug, Clone)]
pub struct AtrStore {
    store: Arc<dyn DocumentStore>,
    location: AtrLocation,
    id: DocumentId,
    kv_timeout: Duration,
    durability: DurabilityLevel,
    cancel: Option<CancelSignal>,
}

impl AtrStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        location: AtrLocation,
        kv_timeout: Duration,
        durability: DurabilityLevel,
    ) -> Self {
        let id = location.document_id();
        Self {
            store,
            location,
            id,
            kv_timeout,
            durability,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Option<CancelSignal>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn location(&self) -> &AtrLocation {
        &self.location
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn read_op(&self, operation: &'static str) -> KvOp {
        KvOp::new(operation, &self.id, self.kv_timeout).cancel(self.cancel.as_ref())
    }

    fn write_op(&self, operation: &'static str) -> KvOp {
        self.read_op(operation).durability(self.durability)
    }

    /// `None` when the ATR document does not exist
    async fn read_entry(&self, attempt_id: &str) -> Result<Option<(Option<AtrEntry>, u64)>> {
        let specs = [LookupInSpec::get_xattr(entry_path(attempt_id))];
        let result = self
            .read_op("atr_lookup")
            .run(self.store.lookup_in(&self.id, &specs, false))
            .await;
        match result {
            Ok(res) => Ok(Some((res.content_as::<AtrEntry>(0)?, res.cas))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one attempt's entry
    pub async fn lookup_entry(&self, attempt_id: &str) -> Result<Option<AtrEntry>> {
        Ok(self.read_entry(attempt_id).await?.and_then(|(entry, _)| entry))
    }

    /// Every parseable entry in the shard
    pub async fn list_entries(&self) -> Result<Vec<(String, AtrEntry)>> {
        let specs = [LookupInSpec::get_xattr(ATTEMPTS_PATH)];
        let result = self
            .read_op("atr_list")
            .run(self.store.lookup_in(&self.id, &specs, false))
            .await;
        let res = match result {
            Ok(res) => res,
            Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let Some(attempts) = res.value(0).and_then(|v| v.as_object()) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::with_capacity(attempts.len());
        for (attempt_id, raw) in attempts {
            match serde_json::from_value::<AtrEntry>(raw.clone()) {
                Ok(entry) => entries.push((attempt_id.clone(), entry)),
                Err(e) => warn!(
                    atr = %self.location,
                    attempt_id = %attempt_id,
                    error = %e,
                    "Skipping unparseable ATR entry"
                ),
            }
        }
        Ok(entries)
    }

    /// Record `doc` in the attempt's entry, creating the entry (and the ATR
    /// document) when `first` is set
    ///
    /// Fails if the entry has left `Staged`, or has disappeared after the
    /// first stage.
    pub async fn stage_entry(
        &self,
        attempt_id: &str,
        template: &AtrEntry,
        kind: StagedKind,
        doc: DocRef,
        first: bool,
    ) -> Result<AtrEntry> {
        for _ in 0..MAX_CAS_RETRIES {
            let (existing, cas) = match self.read_entry(attempt_id).await? {
                Some((entry, cas)) => (entry, Some(cas)),
                None => (None, None),
            };
            let mut entry = match existing {
                Some(entry) if entry.state == AttemptState::Staged => entry,
                Some(entry) => {
                    return Err(TransactionError::AttemptAbortedExternally {
                        attempt_id: attempt_id.to_string(),
                        state: entry.state.to_string(),
                    })
                }
                None if first => template.clone(),
                None => {
                    return Err(TransactionError::AttemptAbortedExternally {
                        attempt_id: attempt_id.to_string(),
                        state: "REMOVED".to_string(),
                    })
                }
            };
            if !entry.add_doc(kind, doc.clone()) {
                return Ok(entry);
            }

            let specs = [MutateInSpec::upsert_xattr(
                entry_path(attempt_id),
                serde_json::to_value(&entry)?,
            )];
            let op = self.write_op("atr_stage");
            let options = op.mutate_options(MutateOptions {
                cas,
                semantics: if cas.is_some() {
                    StoreSemantics::Replace
                } else {
                    StoreSemantics::Insert
                },
                ..Default::default()
            });
            match op.run(self.store.mutate_in(&self.id, &specs, &options)).await {
                Ok(_) => {
                    debug!(
                        atr = %self.location,
                        attempt_id,
                        key = %doc.key,
                        %kind,
                        "Recorded staged document in ATR"
                    );
                    return Ok(entry);
                }
                // The shard document may have been deleted by an attempt that
                // emptied it; the next read decides whether to recreate it.
                Err(StoreError::CasMismatch(_))
                | Err(StoreError::Exists(_))
                | Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::CasMismatch(self.location.key.clone()).into())
    }

    /// Move the attempt's entry from `from` to `to`
    ///
    /// A CAS loss caused by a write to another entry of the same shard is
    /// retried; a loss caused by another actor moving this entry is
    /// reported as [`Transition::Lost`].
    pub async fn transition(
        &self,
        attempt_id: &str,
        from: AttemptState,
        to: AttemptState,
    ) -> Result<Transition> {
        if !from.can_transition_to(to) {
            return Err(TransactionError::IllegalState(format!(
                "{} cannot move from {} to {}",
                attempt_id, from, to
            )));
        }

        for _ in 0..MAX_CAS_RETRIES {
            let Some((Some(mut entry), cas)) = self.read_entry(attempt_id).await? else {
                return Ok(Transition::Missing);
            };
            if entry.state == to {
                return Ok(Transition::Applied(entry));
            }
            if entry.state != from {
                return Ok(Transition::Lost(entry.state));
            }

            entry.stamp(to, self.store.now_ms());
            let specs = [MutateInSpec::replace_xattr(
                entry_path(attempt_id),
                serde_json::to_value(&entry)?,
            )];
            let op = self.write_op("atr_transition");
            let options = op.mutate_options(MutateOptions::with_cas(cas));
            match op.run(self.store.mutate_in(&self.id, &specs, &options)).await {
                Ok(_) => {
                    debug!(atr = %self.location, attempt_id, %from, %to, "ATR transition");
                    return Ok(Transition::Applied(entry));
                }
                Err(StoreError::CasMismatch(_)) => continue,
                Err(StoreError::NotFound(_)) => return Ok(Transition::Missing),
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::CasMismatch(self.location.key.clone()).into())
    }

    /// Remove the attempt's entry; false if it was already gone
    pub async fn remove_entry(&self, attempt_id: &str) -> Result<bool> {
        let specs = [MutateInSpec::remove_xattr(entry_path(attempt_id))];
        let op = self.write_op("atr_remove_entry");
        let options = op.mutate_options(MutateOptions::default());
        match op.run(self.store.mutate_in(&self.id, &specs, &options)).await {
            Ok(_) => {
                debug!(atr = %self.location, attempt_id, "Removed ATR entry");
                Ok(true)
            }
            Err(StoreError::NotFound(_)) | Err(StoreError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the ATR document if it holds no entries
    pub async fn delete_if_empty(&self) -> Result<bool> {
        let specs = [LookupInSpec::get_xattr(ATTEMPTS_PATH)];
        let result = self
            .read_op("atr_lookup")
            .run(self.store.lookup_in(&self.id, &specs, false))
            .await;
        let res = match result {
            Ok(res) => res,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let empty = res
            .value(0)
            .and_then(|v| v.as_object())
            .map_or(true, |attempts| attempts.is_empty());
        if !empty {
            return Ok(false);
        }

        let op = self.write_op("atr_delete");
        let options = op.mutate_options(MutateOptions::with_cas(res.cas));
        match op.run(self.store.remove(&self.id, &options)).await {
            Ok(_) => {
                debug!(atr = %self.location, "Deleted empty ATR document");
                Ok(true)
            }
            Err(StoreError::CasMismatch(_)) | Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
