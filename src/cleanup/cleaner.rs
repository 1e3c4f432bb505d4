//! Finalizing an attempt from its ATR entry
//!
//! Cleanup never trusts the state recorded in a request: it re-reads the
//! ATR entry and drives whichever continuation that state calls for.
//!
//! | ATR state            | Continuation                                   |
//! |----------------------|------------------------------------------------|
//! | Staged               | move to RollingBack, then roll back            |
//! | Committing           | unstage every document, move to Committed      |
//! | RollingBack          | discard every marker, move to RolledBack       |
//! | Committed/RolledBack | remove the entry                               |
//!
//! Every step is CAS-guarded, so replaying cleanup for an attempt another
//! actor already finished is a no-op.

use crate::atr::{AtrEntry, AtrStore, AttemptState, StagedKind, Transition};
use crate::attempt::unstage::Unstager;
use crate::cleanup::CleanupRequest;
use crate::error::{Result, TransactionError};
use crate::hooks::CleanupHooks;
use crate::storage::{DocumentId, StoreRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What a cleanup pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Unstaging finished and the entry was removed
    Committed,
    /// Rollback finished and the entry was removed
    RolledBack,
    /// The attempt had already finished; only its entry was removed
    EntryRemoved,
    /// The entry no longer exists
    NothingToDo,
    /// The attempt has not expired yet
    NotExpired,
}

/// Result of one cleanup request, as reported by a forced drain
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupAttempt {
    pub attempt_id: String,
    pub atr_key: String,
    pub atr_bucket: String,
    pub outcome: Option<CleanupOutcome>,
    pub error: Option<String>,
}

impl CleanupAttempt {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives cleanup continuations
pub struct Cleaner {
    registry: Arc<StoreRegistry>,
    kv_timeout: Duration,
    hooks: Arc<dyn CleanupHooks>,
}

/// Bound on re-dispatches after another actor moves the entry mid-cleanup
const MAX_DISPATCH: usize = 4;

impl Cleaner {
    pub fn new(
        registry: Arc<StoreRegistry>,
        kv_timeout: Duration,
        hooks: Arc<dyn CleanupHooks>,
    ) -> Self {
        Self {
            registry,
            kv_timeout,
            hooks,
        }
    }

    /// Finalize the attempt described by `req`
    ///
    /// With `require_expired`, attempts whose ATR entry has not yet expired
    /// by store time are left untouched.
    pub async fn cleanup_attempt(
        &self,
        req: &CleanupRequest,
        require_expired: bool,
    ) -> Result<CleanupOutcome> {
        let store = self.registry.resolve(&req.atr.bucket)?;
        let atr = AtrStore::new(
            Arc::clone(&store),
            req.atr.clone(),
            self.kv_timeout,
            req.durability,
        );

        self.hooks.before_atr_get(&req.atr.key).await?;
        let Some(mut entry) = atr.lookup_entry(&req.attempt_id).await? else {
            debug!(attempt_id = %req.attempt_id, atr = %req.atr, "Nothing to clean up");
            return Ok(CleanupOutcome::NothingToDo);
        };
        if require_expired && !entry.has_expired(store.now_ms()) {
            return Ok(CleanupOutcome::NotExpired);
        }

        let unstager = Unstager::new(self.kv_timeout, entry.durability_level(), None);
        for _ in 0..MAX_DISPATCH {
            let next = match entry.state {
                AttemptState::Pending | AttemptState::Staged => {
                    atr.transition(&req.attempt_id, AttemptState::Staged, AttemptState::RollingBack)
                        .await?
                }
                AttemptState::Committing => {
                    self.commit_docs(&unstager, &req.attempt_id, &entry).await?;
                    self.finish(&atr, req, AttemptState::Committing, AttemptState::Committed)
                        .await?;
                    return self.done(&atr, req, CleanupOutcome::Committed).await;
                }
                AttemptState::RollingBack => {
                    self.rollback_docs(&unstager, &req.attempt_id, &entry).await?;
                    self.finish(&atr, req, AttemptState::RollingBack, AttemptState::RolledBack)
                        .await?;
                    return self.done(&atr, req, CleanupOutcome::RolledBack).await;
                }
                AttemptState::Committed | AttemptState::RolledBack => {
                    return self.done(&atr, req, CleanupOutcome::EntryRemoved).await;
                }
            };
            match next {
                Transition::Applied(updated) => entry = updated,
                Transition::Lost(state) => entry.state = state,
                Transition::Missing => return Ok(CleanupOutcome::NothingToDo),
            }
        }
        Err(TransactionError::IllegalState(format!(
            "attempt {} kept changing state during cleanup",
            req.attempt_id
        )))
    }

    fn docs(entry: &AtrEntry) -> Vec<(DocumentId, StagedKind)> {
        entry
            .docs()
            .map(|(kind, doc)| (doc.document_id(), kind))
            .collect()
    }

    async fn commit_docs(&self, unstager: &Unstager, attempt_id: &str, entry: &AtrEntry) -> Result<()> {
        for (id, _) in Self::docs(entry) {
            self.hooks.before_commit_doc(&id.key).await?;
            let store = self.registry.resolve(id.bucket())?;
            unstager
                .commit_doc(store.as_ref(), &id, attempt_id, None)
                .await?;
        }
        Ok(())
    }

    async fn rollback_docs(
        &self,
        unstager: &Unstager,
        attempt_id: &str,
        entry: &AtrEntry,
    ) -> Result<()> {
        for (id, _) in Self::docs(entry) {
            self.hooks.before_rollback_doc(&id.key).await?;
            let store = self.registry.resolve(id.bucket())?;
            unstager.rollback_doc(store.as_ref(), &id, attempt_id).await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        atr: &AtrStore,
        req: &CleanupRequest,
        from: AttemptState,
        to: AttemptState,
    ) -> Result<()> {
        match atr.transition(&req.attempt_id, from, to).await? {
            Transition::Applied(_) | Transition::Missing => Ok(()),
            Transition::Lost(state) if state == to => Ok(()),
            Transition::Lost(state) => Err(TransactionError::AttemptAbortedExternally {
                attempt_id: req.attempt_id.clone(),
                state: state.to_string(),
            }),
        }
    }

    async fn done(
        &self,
        atr: &AtrStore,
        req: &CleanupRequest,
        outcome: CleanupOutcome,
    ) -> Result<CleanupOutcome> {
        self.hooks.before_atr_remove(&req.attempt_id).await?;
        atr.remove_entry(&req.attempt_id).await?;
        if let Err(e) = atr.delete_if_empty().await {
            debug!(atr = %req.atr, error = %e, "Could not delete ATR document");
        }
        info!(
            attempt_id = %req.attempt_id,
            txn_id = %req.transaction_id,
            atr = %req.atr,
            ?outcome,
            "Cleaned up attempt"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!("kvtxn_cleanup_completed_total").increment(1);
        Ok(outcome)
    }
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("kv_timeout", &self.kv_timeout)
            .finish_non_exhaustive()
    }
}
