//! Transactions manager
//!
//! The [`TransactionsManager`] is the process-wide entry point. It owns the
//! store registry, the cleanup queue that finalizes attempts this process
//! handed off, and the lost-attempt sweeper that finalizes attempts
//! abandoned by any client.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──▶ workers running ──▶ close() ──▶ workers joined, client records removed
//!                │
//!                └── begin_transaction / run / resume_transaction_attempt
//! ```
//!
//! Background workers are spawned on the current tokio runtime, so the
//! manager must be created from within one.

use crate::attempt::{TransactionGetResult, TransactionResult};
use crate::cleanup::{
    Cleaner, CleanupAttempt, CleanupQueue, CleanupRequest, LostCleanup, LostCleanupSettings,
};
use crate::config::{TransactionOptions, TransactionsConfig};
use crate::error::{Result, TransactionError};
use crate::snapshot::AttemptSnapshot;
use crate::storage::{Cas, Collection, DocumentLocation, StoreRegistry};
use crate::transaction::{Transaction, TransactionSettings};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Initial backoff between attempts in [`TransactionsManager::run`]
const RUN_BACKOFF_MIN: Duration = Duration::from_millis(1);

/// Cap on the backoff between attempts
const RUN_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// State shared by the manager and every transaction it created
pub(crate) struct ManagerContext {
    pub(crate) config: TransactionsConfig,
    pub(crate) registry: Arc<StoreRegistry>,
    pub(crate) cleaner: Arc<Cleaner>,
    pub(crate) queue: Option<Arc<CleanupQueue>>,
    pub(crate) lost: Option<Arc<LostCleanup>>,
    closed: AtomicBool,
}

impl ManagerContext {
    /// Hand an attempt to the cleanup queue; false if nothing will pick it up
    pub(crate) fn enqueue_cleanup(&self, request: CleanupRequest) -> bool {
        match &self.queue {
            Some(queue) => queue.enqueue(request),
            None => {
                debug!(
                    attempt_id = %request.attempt_id,
                    "Client cleanup disabled, leaving attempt to the lost sweeper"
                );
                false
            }
        }
    }

    /// Make sure the lost sweeper covers `location`
    pub(crate) fn watch_location(&self, location: &DocumentLocation) {
        if let Some(lost) = &self.lost {
            lost.add_location(location.clone());
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Entry point for running transactions
pub struct TransactionsManager {
    ctx: Arc<ManagerContext>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionsManager {
    /// Create a manager and start its background cleanup
    pub fn new(config: TransactionsConfig) -> Result<Self> {
        let config = config.normalized()?;
        let needs_runtime = config.cleanup_client_attempts || config.cleanup_lost_attempts;
        if needs_runtime && tokio::runtime::Handle::try_current().is_err() {
            return Err(TransactionError::config(
                "cleanup",
                "background cleanup requires a tokio runtime",
            ));
        }

        let registry = Arc::new(StoreRegistry::new(Arc::clone(&config.resolver)));
        let cleaner = Arc::new(Cleaner::new(
            Arc::clone(&registry),
            config.kv_timeout,
            Arc::clone(&config.hooks.cleanup),
        ));

        let queue = config.cleanup_client_attempts.then(|| {
            Arc::new(CleanupQueue::new(
                config.cleanup_queue_capacity,
                Arc::clone(&cleaner),
                config.cleanup_max_retries,
                config.cleanup_retry_delay,
            ))
        });

        let lost = config.cleanup_lost_attempts.then(|| {
            Arc::new(LostCleanup::new(
                Arc::clone(&registry),
                Arc::clone(&cleaner),
                LostCleanupSettings {
                    window: config.cleanup_window,
                    client_staleness: config.client_staleness_threshold,
                    num_atrs: config.num_atrs,
                    kv_timeout: config.kv_timeout,
                },
                Arc::clone(&config.hooks.client_record),
            ))
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        if let Some(queue) = &queue {
            handles.push(queue.start(shutdown_rx.clone()));
        }
        if let Some(lost) = &lost {
            for location in &config.cleanup_locations {
                lost.add_location(location.clone());
            }
            if let Some(location) = &config.custom_atr_location {
                lost.add_location(location.clone());
            }
            handles.push(lost.start(shutdown_rx));
        }

        info!(
            num_atrs = config.num_atrs,
            durability = %config.durability_level,
            client_cleanup = config.cleanup_client_attempts,
            lost_cleanup = config.cleanup_lost_attempts,
            "Transactions manager started"
        );

        Ok(Self {
            ctx: Arc::new(ManagerContext {
                config,
                registry,
                cleaner,
                queue,
                lost,
                closed: AtomicBool::new(false),
            }),
            shutdown_tx,
            handles: Mutex::new(handles),
        })
    }

    /// Start a new transaction; call [`Transaction::begin_attempt`] before use
    pub fn begin_transaction(&self, options: Option<TransactionOptions>) -> Result<Transaction> {
        if self.ctx.is_closed() {
            return Err(TransactionError::ShuttingDown);
        }
        let options = options.unwrap_or_default();
        options.validate()?;
        let effective = options.apply(&self.ctx.config);
        if let Some(location) = &effective.custom_atr_location {
            self.ctx.watch_location(location);
        }

        Ok(Transaction::new(
            Arc::clone(&self.ctx),
            TransactionSettings {
                transaction_id: uuid::Uuid::new_v4().to_string(),
                expires_at: Instant::now() + effective.expiration_time,
                durability: effective.durability_level,
                kv_timeout: effective.kv_timeout,
                num_atrs: self.ctx.config.num_atrs,
                custom_atr_location: effective.custom_atr_location,
                resolver: options.resolver,
                cancel: options.cancel,
            },
        ))
    }

    /// Rebuild a transaction from bytes produced by [`Transaction::serialize_attempt`]
    ///
    /// Only the resolver and cancel signal of `options` are used; everything
    /// else comes from the snapshot.
    pub fn resume_transaction_attempt(
        &self,
        bytes: &[u8],
        options: Option<TransactionOptions>,
    ) -> Result<Transaction> {
        if self.ctx.is_closed() {
            return Err(TransactionError::ShuttingDown);
        }
        let snapshot = AttemptSnapshot::from_bytes(bytes)?;
        let options = options.unwrap_or_default();
        debug!(
            txn_id = %snapshot.transaction_id,
            attempt_id = %snapshot.attempt_id,
            mutations = snapshot.mutations.len(),
            "Resuming transaction attempt"
        );
        Transaction::resumed(
            Arc::clone(&self.ctx),
            snapshot,
            options.resolver,
            options.cancel,
        )
    }

    /// Run `logic` inside a transaction, retrying with new attempts on
    /// conflicts and transient failures until it commits or expires
    ///
    /// ```rust,ignore
    /// let result = manager
    ///     .run(
    ///         |txn| {
    ///             let coll = coll.clone();
    ///             Box::pin(async move {
    ///                 let doc = txn.get(&coll, "item:42").await?;
    ///                 txn.replace(&doc, json!({"stock": 9})).await?;
    ///                 Ok(())
    ///             })
    ///         },
    ///         None,
    ///     )
    ///     .await?;
    /// ```
    pub async fn run<F>(
        &self,
        mut logic: F,
        options: Option<TransactionOptions>,
    ) -> Result<TransactionResult>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, Result<()>>,
    {
        let mut txn = self.begin_transaction(options)?;
        let mut backoff = RUN_BACKOFF_MIN;

        loop {
            if let Err(e) = txn.begin_attempt() {
                return Err(TransactionError::Failed {
                    attempts: txn.attempts(),
                    source: Box::new(e),
                });
            }

            let outcome = match logic(&mut txn).await {
                Ok(()) => txn.commit().await,
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if txn.attempt().is_some_and(|a| a.state().can_stage()) {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(
                        txn_id = %txn.transaction_id(),
                        error = %rollback_err,
                        "Rollback after failed attempt did not complete"
                    );
                }
            }

            if !err.is_retryable() || txn.has_expired() {
                warn!(
                    txn_id = %txn.transaction_id(),
                    attempts = txn.attempts(),
                    class = %err.class(),
                    error = %err,
                    "Transaction failed"
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("kvtxn_transactions_failed_total").increment(1);
                return Err(TransactionError::Failed {
                    attempts: txn.attempts(),
                    source: Box::new(err),
                });
            }

            debug!(
                txn_id = %txn.transaction_id(),
                attempts = txn.attempts(),
                error = %err,
                "Retrying transaction with a new attempt"
            );
            #[cfg(feature = "metrics")]
            metrics::counter!("kvtxn_attempt_retries_total").increment(1);

            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(jitter_ms).min(txn.time_left())).await;
            backoff = (backoff * 2).min(RUN_BACKOFF_MAX);
        }
    }

    /// Run every queued cleanup request now, regardless of when it is due
    pub async fn force_cleanup_queue(&self) -> Vec<CleanupAttempt> {
        match &self.ctx.queue {
            Some(queue) => queue.force_drain().await,
            None => Vec::new(),
        }
    }

    /// Number of requests waiting in the cleanup queue
    pub fn cleanup_queue_length(&self) -> usize {
        self.ctx.queue.as_ref().map_or(0, |q| q.len())
    }

    /// Build a get result for a document read outside any transaction
    ///
    /// The result can be passed to [`Transaction::replace`] or
    /// [`Transaction::remove`]; its content is not carried.
    pub fn create_get_result(
        &self,
        collection: &Collection,
        key: &str,
        cas: Cas,
    ) -> TransactionGetResult {
        self.ctx.registry.register(collection.store());
        TransactionGetResult {
            id: collection.id(key),
            value: Value::Null,
            cas,
            marker: None,
        }
    }

    pub fn config(&self) -> &TransactionsConfig {
        &self.ctx.config
    }

    /// The lost-attempt sweeper, if enabled
    pub fn lost_cleanup(&self) -> Option<&Arc<LostCleanup>> {
        self.ctx.lost.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    /// Stop background cleanup and wait for the workers to exit
    ///
    /// Idempotent. Transactions still alive afterwards fail with
    /// [`TransactionError::ShuttingDown`].
    pub async fn close(&self) {
        if self.ctx.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing transactions manager");
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cleanup worker exited abnormally");
            }
        }

        let pending = self.cleanup_queue_length();
        if pending > 0 {
            warn!(pending, "Cleanup requests left unprocessed at shutdown");
        }
        info!("Transactions manager closed");
    }
}

impl Drop for TransactionsManager {
    fn drop(&mut self) {
        self.ctx.closed.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for TransactionsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionsManager")
            .field("config", &self.ctx.config)
            .field("closed", &self.ctx.is_closed())
            .field("queue_length", &self.cleanup_queue_length())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use crate::storage::{MemoryStore, StaticResolver};
    use serde_json::json;

    fn manager_for(store: &Arc<MemoryStore>) -> TransactionsManager {
        let mut config = TransactionsConfig::default()
            .with_resolver(Arc::new(StaticResolver::new().with_store(store.clone())));
        config.durability_level = DurabilityLevel::None;
        TransactionsManager::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_begin_rejects_invalid_options() {
        let store = Arc::new(MemoryStore::new("default"));
        let manager = manager_for(&store);
        let opts = TransactionOptions::new().kv_timeout(Duration::ZERO);
        let err = manager.begin_transaction(Some(opts)).unwrap_err();
        assert!(matches!(err, TransactionError::Config(_)));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_begin_after_close_is_rejected() {
        let store = Arc::new(MemoryStore::new("default"));
        let manager = manager_for(&store);
        manager.close().await;
        manager.close().await;
        assert!(matches!(
            manager.begin_transaction(None),
            Err(TransactionError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_run_commits_insert() {
        let store = Arc::new(MemoryStore::new("default"));
        let manager = manager_for(&store);
        let coll = Collection::default_collection(store.clone());

        let logic_coll = coll.clone();
        let result = manager
            .run(
                |txn| {
                    let coll = logic_coll.clone();
                    Box::pin(async move {
                        txn.insert(&coll, "a", json!({"n": 1})).await?;
                        Ok(())
                    })
                },
                None,
            )
            .await
            .unwrap();

        assert!(result.unstaging_complete);
        assert_eq!(coll.get("a").await.unwrap().value, json!({"n": 1}));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_run_does_not_retry_logic_errors() {
        let store = Arc::new(MemoryStore::new("default"));
        let manager = manager_for(&store);
        let coll = Collection::default_collection(store.clone());

        let mut calls = 0u32;
        let err = manager
            .run(
                |txn| {
                    calls += 1;
                    let coll = coll.clone();
                    Box::pin(async move {
                        txn.get(&coll, "missing").await?;
                        Ok(())
                    })
                },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(calls, 1);
        match err {
            TransactionError::Failed { attempts, source } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*source, TransactionError::DocumentNotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        manager.close().await;
    }

    #[tokio::test]
    async fn test_run_does_not_retry_swallowed_insert_conflict() {
        let store = Arc::new(MemoryStore::new("default"));
        let manager = manager_for(&store);
        let coll = Collection::default_collection(store.clone());
        coll.insert("a", json!({"n": 0})).await.unwrap();

        let mut calls = 0u32;
        let err = manager
            .run(
                |txn| {
                    calls += 1;
                    let coll = coll.clone();
                    Box::pin(async move {
                        // Ignore the error; commit must still refuse
                        let _ = txn.insert(&coll, "a", json!({"n": 1})).await;
                        Ok(())
                    })
                },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(calls, 1);
        match err {
            TransactionError::Failed { attempts, source } => {
                assert_eq!(attempts, 1);
                assert!(matches!(
                    *source,
                    TransactionError::PreviousOperationFailed {
                        retryable: false,
                        ..
                    }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(coll.get("a").await.unwrap().value, json!({"n": 0}));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_create_get_result_allows_replace() {
        let store = Arc::new(MemoryStore::new("default"));
        let manager = manager_for(&store);
        let coll = Collection::default_collection(store.clone());
        let written = coll.insert("k", json!({"v": 1})).await.unwrap();

        let doc = manager.create_get_result(&coll, "k", written.cas);
        assert_eq!(doc.value, Value::Null);

        let mut txn = manager.begin_transaction(None).unwrap();
        txn.begin_attempt().unwrap();
        txn.replace(&doc, json!({"v": 2})).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(coll.get("k").await.unwrap().value, json!({"v": 2}));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_queue_length_zero_without_client_cleanup() {
        let store = Arc::new(MemoryStore::new("default"));
        let mut config = TransactionsConfig::default()
            .with_resolver(Arc::new(StaticResolver::new().with_store(store.clone())));
        config.cleanup_client_attempts = false;
        let manager = TransactionsManager::new(config).unwrap();
        assert_eq!(manager.cleanup_queue_length(), 0);
        assert!(manager.force_cleanup_queue().await.is_empty());
        manager.close().await;
    }
}
