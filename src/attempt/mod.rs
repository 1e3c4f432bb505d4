//! Attempt state machine
//!
//! An attempt drives one execution try of a transaction:
//!
//! ```text
//! Pending ──first stage──▶ Staged ──commit point──▶ Committing ──▶ Committed
//!                             │                                      (entry removed)
//!                             └──────rollback──────▶ RollingBack ──▶ RolledBack
//!                                                                    (entry removed)
//! ```
//!
//! Every edge is one CAS write on the attempt's ATR entry. Losing the CAS to
//! another actor never retries blindly: the entry is re-read and the attempt
//! gives up if someone else already moved it.
//!
//! Failure handling:
//! - before the commit point, errors are returned to the caller and the
//!   attempt is rolled back on commit (or explicitly by the caller)
//! - after the commit point, errors never reach the caller; the attempt is
//!   handed to the cleanup queue and reported with `unstaging_complete =
//!   false`
//! - an expired attempt makes no further progress of its own; it is handed
//!   to the cleanup queue

pub mod marker;
mod staging;
pub(crate) mod unstage;

pub use marker::{StagedMutation, StagingMarker, TransactionGetResult, TransactionResult};
pub use unstage::UnstageOutcome;

use crate::atr::{AtrLocation, AtrStore, AttemptState, Transition};
use crate::cleanup::CleanupRequest;
use crate::config::DurabilityLevel;
use crate::error::{ErrorClass, Result, TransactionError};
use crate::hooks::{stage, TransactionHooks};
use crate::manager::ManagerContext;
use crate::storage::{CancelSignal, DocumentLocation, DocumentStore, StoreResolver};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use unstage::Unstager;

/// Retries of the commit point write after an ambiguous outcome
const MAX_AMBIGUITY_RETRIES: usize = 3;

/// Settings an attempt inherits from its transaction
#[derive(Clone)]
pub(crate) struct AttemptSettings {
    pub transaction_id: String,
    pub attempt_id: String,
    pub expires_at: Instant,
    pub durability: DurabilityLevel,
    pub kv_timeout: Duration,
    pub num_atrs: u32,
    pub custom_atr_location: Option<DocumentLocation>,
    pub resolver: Option<Arc<dyn StoreResolver>>,
    pub cancel: Option<CancelSignal>,
}

/// First error seen by an attempt, replayed to every later operation
#[derive(Debug, Clone)]
struct Failure {
    class: ErrorClass,
    cause: String,
    retryable: bool,
}

impl Failure {
    fn new(e: &TransactionError) -> Self {
        Self {
            class: e.class(),
            cause: e.to_string(),
            retryable: e.is_retryable(),
        }
    }

    fn to_error(&self) -> TransactionError {
        TransactionError::PreviousOperationFailed {
            cause: self.cause.clone(),
            class: self.class,
            retryable: self.retryable,
        }
    }
}

/// One execution try of a transaction
pub struct Attempt {
    ctx: Arc<ManagerContext>,
    id: String,
    transaction_id: String,
    state: AttemptState,
    expires_at: Instant,
    durability: DurabilityLevel,
    kv_timeout: Duration,
    num_atrs: u32,
    custom_atr_location: Option<DocumentLocation>,
    resolver: Option<Arc<dyn StoreResolver>>,
    cancel: Option<CancelSignal>,
    hooks: Arc<dyn TransactionHooks>,
    atr: Option<AtrStore>,
    mutations: Vec<StagedMutation>,
    failure: Option<Failure>,
    handed_off: bool,
}

impl Attempt {
    pub(crate) fn new(ctx: Arc<ManagerContext>, settings: AttemptSettings) -> Self {
        let hooks = Arc::clone(&ctx.config.hooks.transaction);
        debug!(
            txn_id = %settings.transaction_id,
            attempt_id = %settings.attempt_id,
            "Attempt started"
        );
        Self {
            ctx,
            id: settings.attempt_id,
            transaction_id: settings.transaction_id,
            state: AttemptState::Pending,
            expires_at: settings.expires_at,
            durability: settings.durability,
            kv_timeout: settings.kv_timeout,
            num_atrs: settings.num_atrs,
            custom_atr_location: settings.custom_atr_location,
            resolver: settings.resolver,
            cancel: settings.cancel,
            hooks,
            atr: None,
            mutations: Vec::new(),
            failure: None,
            handed_off: false,
        }
    }

    /// Rebuild an attempt from a snapshot
    ///
    /// An attempt that had already staged something comes back in `Staged`
    /// with its recorded ATR location honored verbatim.
    pub(crate) fn resume(
        ctx: Arc<ManagerContext>,
        settings: AttemptSettings,
        atr: Option<AtrLocation>,
        mutations: Vec<StagedMutation>,
    ) -> Result<Self> {
        let mut attempt = Self::new(ctx, settings);
        if let Some(location) = atr {
            let store = attempt.store_for(&location.bucket)?;
            attempt.ctx.watch_location(&location.location());
            attempt.atr = Some(
                AtrStore::new(store, location, attempt.kv_timeout, attempt.durability)
                    .with_cancel(attempt.cancel.clone()),
            );
            attempt.state = AttemptState::Staged;
        } else if !mutations.is_empty() {
            return Err(TransactionError::invalid_snapshot(
                "staged mutations without an ATR location",
            ));
        }
        attempt.mutations = mutations;
        info!(
            txn_id = %attempt.transaction_id,
            attempt_id = %attempt.id,
            state = %attempt.state,
            mutations = attempt.mutations.len(),
            "Resumed attempt"
        );
        Ok(attempt)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn durability(&self) -> DurabilityLevel {
        self.durability
    }

    pub fn kv_timeout(&self) -> Duration {
        self.kv_timeout
    }

    pub fn num_atrs(&self) -> u32 {
        self.num_atrs
    }

    /// ATR of this attempt, once it has staged something
    pub fn atr_location(&self) -> Option<&AtrLocation> {
        self.atr.as_ref().map(|atr| atr.location())
    }

    pub fn mutations(&self) -> &[StagedMutation] {
        &self.mutations
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn time_left(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether an earlier operation of this attempt failed
    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Store serving `bucket`, trying the transaction's own resolver last
    fn store_for(&self, bucket: &str) -> Result<Arc<dyn DocumentStore>> {
        match self.ctx.registry.resolve(bucket) {
            Ok(store) => Ok(store),
            Err(e) => match &self.resolver {
                Some(resolver) => {
                    let store = resolver.resolve(bucket)?;
                    self.ctx.registry.register(&store);
                    Ok(store)
                }
                None => Err(e.into()),
            },
        }
    }

    fn atr_store(&self) -> Result<AtrStore> {
        self.atr.clone().ok_or_else(|| {
            TransactionError::Internal(format!("attempt {} has no ATR", self.id))
        })
    }

    fn unstager(&self) -> Unstager {
        Unstager::new(self.kv_timeout, self.durability, self.cancel.clone())
    }

    /// Whether the attempt must stop making progress of its own
    async fn has_expired(&self, stage: &str, key: Option<&str>) -> bool {
        Instant::now() >= self.expires_at || self.hooks.has_expired_client_side(stage, key).await
    }

    /// Remember the first failure of the attempt
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if self.failure.is_none() {
                debug!(attempt_id = %self.id, error = %e, "Attempt operation failed");
                self.failure = Some(Failure::new(e));
            }
        }
        result
    }

    /// Checks shared by every staging operation
    async fn preflight(&self, stage: &str, key: Option<&str>) -> Result<()> {
        if self.ctx.is_closed() {
            return Err(TransactionError::ShuttingDown);
        }
        if let Some(failure) = &self.failure {
            return Err(failure.to_error());
        }
        if !self.state.can_stage() {
            return Err(TransactionError::IllegalState(format!(
                "cannot {} in state {}",
                stage, self.state
            )));
        }
        if self.has_expired(stage, key).await {
            return Err(TransactionError::AttemptExpired(self.id.clone()));
        }
        Ok(())
    }

    /// Queue this attempt for background finalization
    fn hand_to_cleanup(&mut self, state: AttemptState) {
        if self.handed_off {
            return;
        }
        let Some(atr) = &self.atr else {
            return;
        };
        let request = CleanupRequest {
            attempt_id: self.id.clone(),
            transaction_id: self.transaction_id.clone(),
            atr: atr.location().clone(),
            state,
            docs: self
                .mutations
                .iter()
                .map(|m| (m.id.clone(), m.kind))
                .collect(),
            durability: self.durability,
            ready_at: self.expires_at + self.ctx.config.cleanup_grace,
            retries: 0,
        };
        self.handed_off = self.ctx.enqueue_cleanup(request);
    }

    /// Commit every staged mutation
    pub(crate) async fn commit(&mut self) -> Result<TransactionResult> {
        if let Some(failure) = self.failure.clone() {
            if self.state == AttemptState::Staged
                && self.has_expired(stage::ROLLBACK, None).await
            {
                self.hand_to_cleanup(AttemptState::Staged);
            } else if self.state.can_stage() {
                if let Err(e) = self.rollback_internal().await {
                    debug!(attempt_id = %self.id, error = %e, "Rollback after failed operation did not finish");
                }
            }
            return Err(failure.to_error());
        }

        match self.state {
            AttemptState::Pending => {
                self.state = AttemptState::Committed;
                debug!(attempt_id = %self.id, "Committed attempt with nothing staged");
                return Ok(self.result(true));
            }
            AttemptState::Staged => {}
            other => {
                return Err(TransactionError::IllegalState(format!(
                    "cannot commit attempt in state {}",
                    other
                )))
            }
        }

        if self.has_expired(stage::BEFORE_COMMIT, None).await {
            warn!(
                txn_id = %self.transaction_id,
                attempt_id = %self.id,
                "Attempt expired before commit, leaving it to cleanup"
            );
            self.hand_to_cleanup(AttemptState::Staged);
            return self.record(Err(TransactionError::AttemptExpired(self.id.clone())));
        }

        if let Err(e) = self.reach_commit_point().await {
            match &e {
                TransactionError::CommitAmbiguous(_)
                | TransactionError::AttemptAbortedExternally { .. } => {
                    self.hand_to_cleanup(self.state);
                }
                _ => {
                    if let Err(rollback) = self.rollback_internal().await {
                        debug!(attempt_id = %self.id, error = %rollback, "Rollback after failed commit did not finish");
                    }
                }
            }
            return self.record(Err(e));
        }

        // The transaction is decided; nothing below is reported as an error.
        let unstaging_complete = match self.finish_commit().await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    txn_id = %self.transaction_id,
                    attempt_id = %self.id,
                    error = %e,
                    "Unstaging failed after the commit point, deferring to cleanup"
                );
                self.hand_to_cleanup(self.state);
                false
            }
        };

        info!(
            txn_id = %self.transaction_id,
            attempt_id = %self.id,
            mutations = self.mutations.len(),
            unstaging_complete,
            "Transaction committed"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!("kvtxn_commits_total").increment(1);
        Ok(self.result(unstaging_complete))
    }

    fn result(&self, unstaging_complete: bool) -> TransactionResult {
        TransactionResult {
            transaction_id: self.transaction_id.clone(),
            attempt_id: self.id.clone(),
            unstaging_complete,
        }
    }

    /// Move the ATR entry to Committing
    async fn reach_commit_point(&mut self) -> Result<()> {
        self.hooks.before_atr_commit(&self.id).await?;
        let atr = self.atr_store()?;
        let mut ambiguous = 0;
        loop {
            match atr
                .transition(&self.id, AttemptState::Staged, AttemptState::Committing)
                .await
            {
                Ok(Transition::Applied(_)) => {
                    self.state = AttemptState::Committing;
                    debug!(attempt_id = %self.id, atr = %atr.location(), "Reached commit point");
                    return Ok(());
                }
                Ok(Transition::Lost(state)) => {
                    return Err(TransactionError::AttemptAbortedExternally {
                        attempt_id: self.id.clone(),
                        state: state.to_string(),
                    })
                }
                Ok(Transition::Missing) => {
                    return Err(TransactionError::AttemptAbortedExternally {
                        attempt_id: self.id.clone(),
                        state: "REMOVED".to_string(),
                    })
                }
                Err(TransactionError::Store(e)) if e.is_ambiguous() => {
                    if ambiguous >= MAX_AMBIGUITY_RETRIES {
                        return Err(TransactionError::CommitAmbiguous(self.id.clone()));
                    }
                    ambiguous += 1;
                    debug!(attempt_id = %self.id, error = %e, "Commit point outcome unknown, re-checking");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unstage every document and retire the ATR entry
    async fn finish_commit(&mut self) -> Result<()> {
        self.hooks.after_atr_commit(&self.id).await?;
        let unstager = self.unstager();
        for mutation in &self.mutations {
            self.hooks.before_doc_committed(&mutation.id.key).await?;
            let store = self.store_for(mutation.id.bucket())?;
            unstager
                .commit_doc(store.as_ref(), &mutation.id, &self.id, mutation.staged.as_ref())
                .await?;
        }

        self.hooks.before_atr_complete(&self.id).await?;
        let atr = self.atr_store()?;
        match atr
            .transition(&self.id, AttemptState::Committing, AttemptState::Committed)
            .await?
        {
            Transition::Applied(_) | Transition::Missing => {}
            Transition::Lost(state) => {
                return Err(TransactionError::AttemptAbortedExternally {
                    attempt_id: self.id.clone(),
                    state: state.to_string(),
                })
            }
        }
        self.state = AttemptState::Committed;
        atr.remove_entry(&self.id).await?;
        if let Err(e) = atr.delete_if_empty().await {
            debug!(atr = %atr.location(), error = %e, "Could not delete ATR document");
        }
        Ok(())
    }

    /// Discard every staged mutation
    pub(crate) async fn rollback(&mut self) -> Result<()> {
        match self.state {
            AttemptState::Pending | AttemptState::Staged => {}
            AttemptState::Committing | AttemptState::Committed => {
                return Err(TransactionError::IllegalState(
                    "cannot roll back after the commit point".to_string(),
                ))
            }
            other => {
                return Err(TransactionError::IllegalState(format!(
                    "cannot roll back attempt in state {}",
                    other
                )))
            }
        }
        if self.state == AttemptState::Staged && self.has_expired(stage::ROLLBACK, None).await {
            warn!(
                txn_id = %self.transaction_id,
                attempt_id = %self.id,
                "Attempt expired before rollback, leaving it to cleanup"
            );
            self.hand_to_cleanup(AttemptState::Staged);
            return Err(TransactionError::AttemptExpired(self.id.clone()));
        }
        self.rollback_internal().await
    }

    async fn rollback_internal(&mut self) -> Result<()> {
        if self.state == AttemptState::Pending {
            self.state = AttemptState::RolledBack;
            return Ok(());
        }
        let result = self.rollback_steps().await;
        match &result {
            Ok(()) => {
                info!(
                    txn_id = %self.transaction_id,
                    attempt_id = %self.id,
                    mutations = self.mutations.len(),
                    "Transaction rolled back"
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("kvtxn_rollbacks_total").increment(1);
            }
            Err(e) => {
                warn!(
                    attempt_id = %self.id,
                    error = %e,
                    "Rollback failed, deferring to cleanup"
                );
                self.hand_to_cleanup(self.state);
            }
        }
        result
    }

    async fn rollback_steps(&mut self) -> Result<()> {
        let atr = self.atr_store()?;
        match atr
            .transition(&self.id, AttemptState::Staged, AttemptState::RollingBack)
            .await?
        {
            Transition::Applied(_) => self.state = AttemptState::RollingBack,
            Transition::Missing | Transition::Lost(AttemptState::RolledBack) => {
                self.state = AttemptState::RolledBack;
                return Ok(());
            }
            Transition::Lost(state) => {
                return Err(TransactionError::AttemptAbortedExternally {
                    attempt_id: self.id.clone(),
                    state: state.to_string(),
                })
            }
        }

        let unstager = self.unstager();
        for mutation in &self.mutations {
            self.hooks.before_doc_rolled_back(&mutation.id.key).await?;
            let store = self.store_for(mutation.id.bucket())?;
            unstager
                .rollback_doc(store.as_ref(), &mutation.id, &self.id)
                .await?;
        }

        self.hooks.before_atr_rolled_back(&self.id).await?;
        match atr
            .transition(&self.id, AttemptState::RollingBack, AttemptState::RolledBack)
            .await?
        {
            Transition::Applied(_) | Transition::Missing => {}
            Transition::Lost(state) => {
                return Err(TransactionError::AttemptAbortedExternally {
                    attempt_id: self.id.clone(),
                    state: state.to_string(),
                })
            }
        }
        self.state = AttemptState::RolledBack;
        atr.remove_entry(&self.id).await?;
        if let Err(e) = atr.delete_if_empty().await {
            debug!(atr = %atr.location(), error = %e, "Could not delete ATR document");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attempt")
            .field("id", &self.id)
            .field("transaction_id", &self.transaction_id)
            .field("state", &self.state)
            .field("atr", &self.atr_location())
            .field("mutations", &self.mutations.len())
            .field("failed", &self.failure.is_some())
            .finish()
    }
}
