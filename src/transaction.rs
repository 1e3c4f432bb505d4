//! Transactions
//!
//! A [`Transaction`] owns the identity, expiry and durability shared by all
//! of its attempts and exposes the current attempt's operations. A
//! transaction runs at most one attempt at a time; [`Transaction::begin_attempt`]
//! starts a fresh one after a retryable failure.
//!
//! ```rust,ignore
//! let mut txn = manager.begin_transaction(None)?;
//! txn.begin_attempt()?;
//! let doc = txn.get(&collection, "item:42").await?;
//! txn.replace(&doc, json!({"stock": 9})).await?;
//! let result = txn.commit().await?;
//! ```

use crate::atr::{AtrLocation, AttemptState};
use crate::attempt::{Attempt, AttemptSettings, StagedMutation, TransactionGetResult, TransactionResult};
use crate::config::DurabilityLevel;
use crate::error::{Result, TransactionError};
use crate::manager::ManagerContext;
use crate::snapshot::AttemptSnapshot;
use crate::storage::{CancelSignal, Collection, DocumentLocation, StoreResolver};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A transaction and its current attempt
pub struct Transaction {
    ctx: Arc<ManagerContext>,
    transaction_id: String,
    expires_at: Instant,
    durability: DurabilityLevel,
    kv_timeout: Duration,
    num_atrs: u32,
    custom_atr_location: Option<DocumentLocation>,
    resolver: Option<Arc<dyn StoreResolver>>,
    cancel: Option<CancelSignal>,
    attempt: Option<Attempt>,
    attempts_started: u32,
}

/// Settings a transaction is created with
pub(crate) struct TransactionSettings {
    pub transaction_id: String,
    pub expires_at: Instant,
    pub durability: DurabilityLevel,
    pub kv_timeout: Duration,
    pub num_atrs: u32,
    pub custom_atr_location: Option<DocumentLocation>,
    pub resolver: Option<Arc<dyn StoreResolver>>,
    pub cancel: Option<CancelSignal>,
}

impl Transaction {
    pub(crate) fn new(ctx: Arc<ManagerContext>, settings: TransactionSettings) -> Self {
        debug!(
            txn_id = %settings.transaction_id,
            durability = %settings.durability,
            "Transaction created"
        );
        Self {
            ctx,
            transaction_id: settings.transaction_id,
            expires_at: settings.expires_at,
            durability: settings.durability,
            kv_timeout: settings.kv_timeout,
            num_atrs: settings.num_atrs,
            custom_atr_location: settings.custom_atr_location,
            resolver: settings.resolver,
            cancel: settings.cancel,
            attempt: None,
            attempts_started: 0,
        }
    }

    /// Rebuild a transaction around a previously serialized attempt
    pub(crate) fn resumed(
        ctx: Arc<ManagerContext>,
        snapshot: AttemptSnapshot,
        resolver: Option<Arc<dyn StoreResolver>>,
        cancel: Option<CancelSignal>,
    ) -> Result<Self> {
        let mut txn = Self::new(
            Arc::clone(&ctx),
            TransactionSettings {
                transaction_id: snapshot.transaction_id.clone(),
                expires_at: Instant::now() + snapshot.time_left,
                durability: snapshot.durability,
                kv_timeout: snapshot.kv_timeout,
                num_atrs: snapshot.num_atrs,
                custom_atr_location: snapshot.atr.as_ref().map(|atr| atr.location()),
                resolver,
                cancel,
            },
        );
        let settings = txn.attempt_settings(snapshot.attempt_id.clone());
        let mutations = snapshot
            .mutations
            .into_iter()
            .map(|m| StagedMutation {
                id: m.id,
                kind: m.kind,
                staged: None,
                cas: m.cas,
                original_cas: None,
            })
            .collect();
        txn.attempt = Some(Attempt::resume(ctx, settings, snapshot.atr, mutations)?);
        txn.attempts_started = 1;
        Ok(txn)
    }

    fn attempt_settings(&self, attempt_id: String) -> AttemptSettings {
        AttemptSettings {
            transaction_id: self.transaction_id.clone(),
            attempt_id,
            expires_at: self.expires_at,
            durability: self.durability,
            kv_timeout: self.kv_timeout,
            num_atrs: self.num_atrs,
            custom_atr_location: self.custom_atr_location.clone(),
            resolver: self.resolver.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Start a new attempt, replacing the previous one
    pub fn begin_attempt(&mut self) -> Result<()> {
        if self.ctx.is_closed() {
            return Err(TransactionError::ShuttingDown);
        }
        if self.has_expired() {
            return Err(TransactionError::AttemptExpired(
                self.attempt_id().unwrap_or(&self.transaction_id).to_string(),
            ));
        }
        if let Some(previous) = &self.attempt {
            if previous.state() == AttemptState::Staged {
                debug!(
                    txn_id = %self.transaction_id,
                    attempt_id = %previous.id(),
                    "Starting a new attempt over an unresolved one"
                );
            }
        }
        let settings = self.attempt_settings(uuid::Uuid::new_v4().to_string());
        self.attempt = Some(Attempt::new(Arc::clone(&self.ctx), settings));
        self.attempts_started += 1;
        Ok(())
    }

    fn attempt_mut(&mut self) -> Result<&mut Attempt> {
        self.attempt
            .as_mut()
            .ok_or_else(|| TransactionError::IllegalState("no attempt has been started".to_string()))
    }

    /// Read a document, failing if it does not exist
    pub async fn get(&mut self, collection: &Collection, key: &str) -> Result<TransactionGetResult> {
        self.attempt_mut()?.get(collection, key).await
    }

    /// Read a document, `None` if it does not exist
    pub async fn get_optional(
        &mut self,
        collection: &Collection,
        key: &str,
    ) -> Result<Option<TransactionGetResult>> {
        self.attempt_mut()?.get_optional(collection, key).await
    }

    /// Stage the creation of a document
    pub async fn insert(
        &mut self,
        collection: &Collection,
        key: &str,
        value: Value,
    ) -> Result<TransactionGetResult> {
        self.attempt_mut()?.insert(collection, key, value).await
    }

    /// Stage new content for a document previously read
    pub async fn replace(&mut self, doc: &TransactionGetResult, value: Value) -> Result<TransactionGetResult> {
        self.attempt_mut()?.replace(doc, value).await
    }

    /// Stage the removal of a document previously read
    pub async fn remove(&mut self, doc: &TransactionGetResult) -> Result<()> {
        self.attempt_mut()?.remove(doc).await
    }

    /// Commit the current attempt
    pub async fn commit(&mut self) -> Result<TransactionResult> {
        self.attempt_mut()?.commit().await
    }

    /// Roll back the current attempt
    pub async fn rollback(&mut self) -> Result<()> {
        self.attempt_mut()?.rollback().await
    }

    /// Serialize the current attempt so another process can resume it
    pub fn serialize_attempt(&self) -> Result<Vec<u8>> {
        let attempt = self
            .attempt
            .as_ref()
            .ok_or_else(|| TransactionError::IllegalState("no attempt has been started".to_string()))?;
        if !attempt.state().can_stage() {
            return Err(TransactionError::IllegalState(format!(
                "cannot serialize attempt in state {}",
                attempt.state()
            )));
        }
        AttemptSnapshot::from_attempt(attempt).to_bytes()
    }

    pub fn has_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn attempt_id(&self) -> Option<&str> {
        self.attempt.as_ref().map(|a| a.id())
    }

    pub fn attempt(&self) -> Option<&Attempt> {
        self.attempt.as_ref()
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts_started
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

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn time_left(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// ATR of the current attempt, once it has staged something
    pub fn atr_location(&self) -> Option<&AtrLocation> {
        self.attempt.as_ref().and_then(|a| a.atr_location())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("transaction_id", &self.transaction_id)
            .field("durability", &self.durability)
            .field("time_left", &self.time_left())
            .field("attempt", &self.attempt)
            .finish()
    }
}
