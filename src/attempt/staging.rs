//! Reads and staged writes of an attempt
//!
//! Staging never changes a document's visible body. Every write records the
//! document in the attempt's ATR entry first, then puts a marker beside the
//! body with a CAS-guarded metadata write. A marker owned by another live
//! attempt is a write-write conflict; one owned by an expired attempt is
//! cleaned up before a single retry.

use super::{Attempt, StagedMutation, StagingMarker, TransactionGetResult};
use crate::atr::{AtrEntry, AtrStore, AttemptState, DocRef, StagedKind};
use crate::attempt::marker::MARKER_PATH;
use crate::cleanup::{CleanupOutcome, CleanupRequest};
use crate::error::{Result, StoreError, TransactionError};
use crate::hooks::stage;
use crate::storage::{
    Cas, Collection, DocumentId, DocumentStore, KvOp, LookupInSpec, MutateInSpec, MutateOptions,
    StoreSemantics,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Attempts at overwriting a tombstone or a cleaned-up blocker
const MAX_STAGE_ROUNDS: usize = 4;

/// A document as read by an attempt, tombstones included
#[derive(Debug)]
struct DocSnapshot {
    body: Option<Value>,
    deleted: bool,
    cas: Cas,
    marker: Option<StagingMarker>,
}

impl DocSnapshot {
    fn is_visible(&self) -> bool {
        !self.deleted && self.body.is_some()
    }
}

/// What a foreign marker means for this attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocker {
    /// Owned by a live attempt
    Active,
    /// Its attempt is finished or gone; the marker can be ignored
    Gone,
    /// Its attempt had expired and was just cleaned up; re-read the document
    Cleaned,
}

impl Attempt {
    fn mutation_index(&self, id: &DocumentId) -> Option<usize> {
        self.mutations.iter().position(|m| m.id == *id)
    }

    async fn read_doc(&self, store: &dyn DocumentStore, id: &DocumentId) -> Result<Option<DocSnapshot>> {
        let specs = [LookupInSpec::get_xattr(MARKER_PATH), LookupInSpec::GetDoc];
        let result = KvOp::new("txn_get", id, self.kv_timeout)
            .cancel(self.cancel.as_ref())
            .run(store.lookup_in(id, &specs, true))
            .await;
        let res = match result {
            Ok(res) => res,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let marker = match res.content_as::<StagingMarker>(0) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(key = %id.key, error = %e, "Ignoring unparseable staging marker");
                None
            }
        };
        Ok(Some(DocSnapshot {
            body: res.value(1).cloned(),
            deleted: res.deleted,
            cas: res.cas,
            marker,
        }))
    }

    /// Decide whether a marker left by another attempt blocks this one
    async fn resolve_blocker(&self, marker: &StagingMarker) -> Result<Blocker> {
        if marker.attempt_id() == self.id || marker.transaction_id() == self.transaction_id {
            return Ok(Blocker::Gone);
        }
        let store = self.store_for(&marker.atr.bucket)?;
        let atr = AtrStore::new(
            Arc::clone(&store),
            marker.atr.clone(),
            self.kv_timeout,
            self.durability,
        )
        .with_cancel(self.cancel.clone());

        let Some(entry) = atr.lookup_entry(marker.attempt_id()).await? else {
            return Ok(Blocker::Gone);
        };
        if !entry.has_expired(store.now_ms()) {
            return Ok(Blocker::Active);
        }

        info!(
            attempt_id = %self.id,
            blocking_attempt = %marker.attempt_id(),
            state = %entry.state,
            "Cleaning up expired blocking attempt"
        );
        let request =
            CleanupRequest::from_entry(marker.attempt_id(), marker.atr.clone(), &entry, Instant::now());
        match self.ctx.cleaner.cleanup_attempt(&request, true).await {
            Ok(CleanupOutcome::NotExpired) => Ok(Blocker::Active),
            Ok(_) => Ok(Blocker::Cleaned),
            Err(e) => {
                debug!(blocking_attempt = %marker.attempt_id(), error = %e, "Blocking attempt cleanup failed");
                Ok(Blocker::Active)
            }
        }
    }

    fn conflict(id: &DocumentId, marker: &StagingMarker) -> TransactionError {
        TransactionError::WriteWriteConflict {
            key: id.key.clone(),
            blocking_attempt: marker.attempt_id().to_string(),
        }
    }

    /// Read a document, resolving foreign markers
    async fn read_visible(
        &self,
        store: &dyn DocumentStore,
        id: &DocumentId,
    ) -> Result<Option<TransactionGetResult>> {
        let mut cleaned = false;
        loop {
            let Some(doc) = self.read_doc(store, id).await? else {
                return Ok(None);
            };
            if let Some(marker) = &doc.marker {
                match self.resolve_blocker(marker).await? {
                    Blocker::Active => return Err(Self::conflict(id, marker)),
                    Blocker::Cleaned if !cleaned => {
                        cleaned = true;
                        continue;
                    }
                    Blocker::Cleaned | Blocker::Gone => {}
                }
            }
            if !doc.is_visible() {
                return Ok(None);
            }
            return Ok(Some(TransactionGetResult {
                id: id.clone(),
                value: doc.body.unwrap_or(Value::Null),
                cas: doc.cas,
                marker: doc.marker,
            }));
        }
    }

    /// Read `key`, returning this attempt's own staged content if any
    pub(crate) async fn get_optional(
        &mut self,
        collection: &Collection,
        key: &str,
    ) -> Result<Option<TransactionGetResult>> {
        let checked = self.preflight(stage::GET, Some(key)).await;
        self.record(checked)?;
        self.ctx.registry.register(collection.store());

        let id = collection.id(key);
        if let Some(idx) = self.mutation_index(&id) {
            let mutation = &self.mutations[idx];
            return Ok(match mutation.kind {
                StagedKind::Remove => None,
                StagedKind::Insert | StagedKind::Replace => Some(TransactionGetResult {
                    id,
                    value: mutation.staged.clone().unwrap_or(Value::Null),
                    cas: mutation.cas,
                    marker: None,
                }),
            });
        }

        let result = self.read_visible(collection.store().as_ref(), &id).await;
        self.record(result)
    }

    /// Read `key`, failing if it does not exist
    pub(crate) async fn get(&mut self, collection: &Collection, key: &str) -> Result<TransactionGetResult> {
        self.get_optional(collection, key)
            .await?
            .ok_or_else(|| TransactionError::DocumentNotFound(key.to_string()))
    }

    /// Record `id` in the ATR entry, creating the entry on the first stage
    async fn ensure_atr(&mut self, store: &Arc<dyn DocumentStore>, id: &DocumentId, kind: StagedKind) -> Result<()> {
        if self.atr.is_none() {
            let location = self
                .custom_atr_location
                .clone()
                .unwrap_or_else(|| id.location.clone());
            let atr_store = if location.bucket == store.bucket_name() {
                Arc::clone(store)
            } else {
                self.store_for(&location.bucket)?
            };
            self.ctx.registry.register(&atr_store);
            let atr_location = crate::atr::AtrLocation::for_transaction(
                &location,
                &self.transaction_id,
                self.num_atrs,
            );
            self.atr = Some(
                AtrStore::new(atr_store, atr_location, self.kv_timeout, self.durability)
                    .with_cancel(self.cancel.clone()),
            );
        }

        let first = self.state == AttemptState::Pending;
        if first {
            self.hooks.before_atr_pending(&self.id).await?;
        }
        let atr = self.atr_store()?;
        let template = AtrEntry::new(
            self.transaction_id.clone(),
            atr.store().now_ms(),
            self.time_left().as_millis() as u64,
            self.durability,
        );
        atr.stage_entry(&self.id, &template, kind, DocRef::from(id), first)
            .await?;

        if first {
            self.state = AttemptState::Staged;
            self.ctx.watch_location(&atr.location().location());
            debug!(
                txn_id = %self.transaction_id,
                attempt_id = %self.id,
                atr = %atr.location(),
                "Attempt created its ATR entry"
            );
        }
        Ok(())
    }

    /// Write this attempt's marker on `id`, returning the new CAS
    ///
    /// Without `cas` an insert creates the document as a tombstone carrying
    /// only the marker.
    async fn write_marker(
        &self,
        store: &dyn DocumentStore,
        id: &DocumentId,
        kind: StagedKind,
        staged: Option<&Value>,
        cas: Option<Cas>,
        original_cas: Option<Cas>,
    ) -> Result<Cas> {
        let atr = self.atr_store()?;
        let marker = StagingMarker::new(
            &self.transaction_id,
            &self.id,
            atr.location(),
            kind,
            staged.cloned(),
            original_cas,
        );
        let specs = [MutateInSpec::upsert_xattr(
            MARKER_PATH,
            serde_json::to_value(&marker)?,
        )];
        let create = cas.is_none() && kind == StagedKind::Insert;
        let op = KvOp::new("stage", id, self.kv_timeout)
            .durability(self.durability)
            .cancel(self.cancel.as_ref());
        let options = op.mutate_options(MutateOptions {
            cas,
            semantics: if create {
                StoreSemantics::Insert
            } else {
                StoreSemantics::Replace
            },
            access_deleted: true,
            create_as_deleted: create,
            ..Default::default()
        });
        let result = op.run(store.mutate_in(id, &specs, &options)).await?;
        debug!(key = %id.key, attempt_id = %self.id, %kind, "Staged document");
        Ok(result.cas)
    }

    /// Classify a CAS loss on a staging write
    async fn classify_cas_loss(&self, store: &dyn DocumentStore, id: &DocumentId) -> TransactionError {
        match self.read_doc(store, id).await {
            Ok(Some(DocSnapshot {
                marker: Some(marker),
                ..
            })) if marker.attempt_id() != self.id => match self.resolve_blocker(&marker).await {
                Ok(Blocker::Active) => Self::conflict(id, &marker),
                Ok(_) => TransactionError::CasMismatch(id.key.clone()),
                Err(e) => e,
            },
            Ok(_) => TransactionError::CasMismatch(id.key.clone()),
            Err(e) => e,
        }
    }

    fn push_mutation(&mut self, mutation: StagedMutation) {
        match self.mutation_index(&mutation.id) {
            Some(idx) => self.mutations[idx] = mutation,
            None => self.mutations.push(mutation),
        }
    }

    /// Stage the creation of `key`
    pub(crate) async fn insert(
        &mut self,
        collection: &Collection,
        key: &str,
        value: Value,
    ) -> Result<TransactionGetResult> {
        let checked = self.preflight(stage::INSERT, Some(key)).await;
        self.record(checked)?;
        let store = Arc::clone(collection.store());
        self.ctx.registry.register(&store);
        let id = collection.id(key);
        let result = self.insert_inner(&store, id, value).await;
        self.record(result)
    }

    async fn insert_inner(
        &mut self,
        store: &Arc<dyn DocumentStore>,
        id: DocumentId,
        value: Value,
    ) -> Result<TransactionGetResult> {
        if let Some(idx) = self.mutation_index(&id) {
            let own = self.mutations[idx].clone();
            return match own.kind {
                // Inserting what this attempt removed restores it as a replace.
                StagedKind::Remove => {
                    self.restage(store, own, StagedKind::Replace, Some(value)).await
                }
                StagedKind::Insert | StagedKind::Replace => {
                    Err(TransactionError::DocumentExists(id.key.clone()))
                }
            };
        }

        self.hooks.before_staged_insert(&id.key).await?;
        self.ensure_atr(store, &id, StagedKind::Insert).await?;

        let mut guard: Option<Cas> = None;
        for _ in 0..MAX_STAGE_ROUNDS {
            let written = self
                .write_marker(store.as_ref(), &id, StagedKind::Insert, Some(&value), guard, None)
                .await;
            match written {
                Ok(cas) => {
                    self.push_mutation(StagedMutation {
                        id: id.clone(),
                        kind: StagedKind::Insert,
                        staged: Some(value.clone()),
                        cas,
                        original_cas: None,
                    });
                    return Ok(TransactionGetResult {
                        id,
                        value,
                        cas,
                        marker: None,
                    });
                }
                Err(TransactionError::Store(StoreError::Exists(_)))
                | Err(TransactionError::Store(StoreError::CasMismatch(_)))
                | Err(TransactionError::Store(StoreError::NotFound(_))) => {}
                Err(e) => return Err(e),
            }

            let Some(doc) = self.read_doc(store.as_ref(), &id).await? else {
                guard = None;
                continue;
            };
            if let Some(marker) = &doc.marker {
                if marker.attempt_id() != self.id
                    && self.resolve_blocker(marker).await? == Blocker::Active
                {
                    return Err(Self::conflict(&id, marker));
                }
            }
            if doc.is_visible() {
                return Err(TransactionError::DocumentExists(id.key.clone()));
            }
            // A tombstone, possibly with a stale marker: overwrite it in place.
            guard = Some(doc.cas);
        }
        Err(TransactionError::CasMismatch(id.key.clone()))
    }

    /// Stage the replacement of a document read by this attempt
    pub(crate) async fn replace(
        &mut self,
        doc: &TransactionGetResult,
        value: Value,
    ) -> Result<TransactionGetResult> {
        let checked = self.preflight(stage::REPLACE, Some(doc.key())).await;
        self.record(checked)?;
        let result = self.replace_inner(doc, value).await;
        self.record(result)
    }

    async fn replace_inner(
        &mut self,
        doc: &TransactionGetResult,
        value: Value,
    ) -> Result<TransactionGetResult> {
        let store = self.store_for(doc.id.bucket())?;
        if let Some(idx) = self.mutation_index(&doc.id) {
            let own = self.mutations[idx].clone();
            return match own.kind {
                StagedKind::Remove => Err(TransactionError::DocumentNotFound(doc.id.key.clone())),
                // A staged insert stays an insert with new content.
                StagedKind::Insert => self.restage(&store, own, StagedKind::Insert, Some(value)).await,
                StagedKind::Replace => self.restage(&store, own, StagedKind::Replace, Some(value)).await,
            };
        }

        self.hooks.before_staged_replace(&doc.id.key).await?;
        self.ensure_atr(&store, &doc.id, StagedKind::Replace).await?;
        let cas = self
            .stage_existing(&store, &doc.id, StagedKind::Replace, Some(&value), doc.cas)
            .await?;
        self.push_mutation(StagedMutation {
            id: doc.id.clone(),
            kind: StagedKind::Replace,
            staged: Some(value.clone()),
            cas,
            original_cas: Some(doc.cas),
        });
        Ok(TransactionGetResult {
            id: doc.id.clone(),
            value,
            cas,
            marker: None,
        })
    }

    /// Stage the removal of a document read by this attempt
    pub(crate) async fn remove(&mut self, doc: &TransactionGetResult) -> Result<()> {
        let checked = self.preflight(stage::REMOVE, Some(doc.key())).await;
        self.record(checked)?;
        let result = self.remove_inner(doc).await;
        self.record(result)
    }

    async fn remove_inner(&mut self, doc: &TransactionGetResult) -> Result<()> {
        let store = self.store_for(doc.id.bucket())?;
        if let Some(idx) = self.mutation_index(&doc.id) {
            let own = self.mutations[idx].clone();
            return match own.kind {
                StagedKind::Remove => Err(TransactionError::DocumentNotFound(doc.id.key.clone())),
                StagedKind::Insert => {
                    self.hooks.before_staged_remove(&doc.id.key).await?;
                    self.discard_own_insert(&store, &own).await?;
                    self.mutations.remove(idx);
                    Ok(())
                }
                StagedKind::Replace => self
                    .restage(&store, own, StagedKind::Remove, None)
                    .await
                    .map(|_| ()),
            };
        }

        self.hooks.before_staged_remove(&doc.id.key).await?;
        self.ensure_atr(&store, &doc.id, StagedKind::Remove).await?;
        let cas = self
            .stage_existing(&store, &doc.id, StagedKind::Remove, None, doc.cas)
            .await?;
        self.push_mutation(StagedMutation {
            id: doc.id.clone(),
            kind: StagedKind::Remove,
            staged: None,
            cas,
            original_cas: Some(doc.cas),
        });
        Ok(())
    }

    /// Marker write on a live document at revision `cas`
    async fn stage_existing(
        &self,
        store: &Arc<dyn DocumentStore>,
        id: &DocumentId,
        kind: StagedKind,
        staged: Option<&Value>,
        cas: Cas,
    ) -> Result<Cas> {
        match self
            .write_marker(store.as_ref(), id, kind, staged, Some(cas), Some(cas))
            .await
        {
            Ok(cas) => Ok(cas),
            Err(TransactionError::Store(StoreError::CasMismatch(_))) => {
                Err(self.classify_cas_loss(store.as_ref(), id).await)
            }
            Err(TransactionError::Store(StoreError::NotFound(_))) => {
                Err(TransactionError::DocumentNotFound(id.key.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Overwrite this attempt's own marker on a document staged earlier
    async fn restage(
        &mut self,
        store: &Arc<dyn DocumentStore>,
        own: StagedMutation,
        kind: StagedKind,
        staged: Option<Value>,
    ) -> Result<TransactionGetResult> {
        match kind {
            StagedKind::Insert => self.hooks.before_staged_insert(&own.id.key).await?,
            StagedKind::Replace => self.hooks.before_staged_replace(&own.id.key).await?,
            StagedKind::Remove => self.hooks.before_staged_remove(&own.id.key).await?,
        }
        self.ensure_atr(store, &own.id, kind).await?;
        let cas = match self
            .write_marker(
                store.as_ref(),
                &own.id,
                kind,
                staged.as_ref(),
                Some(own.cas),
                own.original_cas,
            )
            .await
        {
            Ok(cas) => cas,
            Err(TransactionError::Store(StoreError::CasMismatch(_))) => {
                return Err(TransactionError::CasMismatch(own.id.key.clone()))
            }
            Err(e) => return Err(e),
        };
        let result = TransactionGetResult {
            id: own.id.clone(),
            value: staged.clone().unwrap_or(Value::Null),
            cas,
            marker: None,
        };
        self.push_mutation(StagedMutation {
            id: own.id,
            kind,
            staged,
            cas,
            original_cas: own.original_cas,
        });
        Ok(result)
    }

    /// Delete the tombstone created by this attempt's own staged insert
    async fn discard_own_insert(&self, store: &Arc<dyn DocumentStore>, own: &StagedMutation) -> Result<()> {
        let op = KvOp::new("discard_insert", &own.id, self.kv_timeout)
            .durability(self.durability)
            .cancel(self.cancel.as_ref());
        let options = op.mutate_options(MutateOptions {
            cas: Some(own.cas),
            access_deleted: true,
            ..Default::default()
        });
        match op
            .run(store.mutate_in(&own.id, &[MutateInSpec::DeleteDoc], &options))
            .await
        {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(StoreError::CasMismatch(_)) => Err(TransactionError::CasMismatch(own.id.key.clone())),
            Err(e) => Err(e.into()),
        }
    }
}
