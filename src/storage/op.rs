//! Bounded store requests
//!
//! A [`KvOp`] wraps one store request with a deadline and an optional
//! cancellation signal. The issuing call waits until the request completes,
//! the signal fires, or the deadline passes. On cancellation or timeout the
//! request future is dropped and an error is returned; nothing assumes the
//! store-side effect was undone.

use crate::config::defaults::DURABILITY_TIMEOUT_FLOOR;
use crate::config::DurabilityLevel;
use crate::error::StoreError;
use crate::storage::backend::{
    DocumentStore, MutateOptions, MutationResult, ObserveDurability, StoreResult,
};
use crate::storage::DocumentId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

/// Wire expiries at or above this many seconds are absolute unix timestamps
const MAX_RELATIVE_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Create a linked cancel handle and signal
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Fires a [`CancelSignal`]
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal linked to this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observed side of a cancellation
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the linked handle cancels. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Convert a TTL into the store's wire expiry
///
/// Zero means no expiry. Anything shorter than a second is rounded up to one
/// second, durations under 30 days are sent as relative seconds and longer
/// ones as an absolute unix timestamp.
pub fn duration_to_expiry(ttl: Duration) -> u32 {
    if ttl.is_zero() {
        return 0;
    }
    if ttl < Duration::from_secs(1) {
        return 1;
    }
    if ttl < MAX_RELATIVE_EXPIRY {
        return ttl.as_secs() as u32;
    }
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    (now + ttl.as_secs()).min(u64::from(u32::MAX)) as u32
}

/// One store request with its timeout, durability and cancellation settings
#[derive(Debug, Clone)]
pub struct KvOp {
    operation: &'static str,
    id: DocumentId,
    timeout: Duration,
    durability: DurabilityLevel,
    observe: Option<ObserveDurability>,
    cancel: Option<CancelSignal>,
}

impl KvOp {
    pub fn new(operation: &'static str, id: &DocumentId, timeout: Duration) -> Self {
        Self {
            operation,
            id: id.clone(),
            timeout,
            durability: DurabilityLevel::None,
            observe: None,
            cancel: None,
        }
    }

    pub fn durability(mut self, level: DurabilityLevel) -> Self {
        self.durability = level;
        self
    }

    pub fn observe(mut self, requirement: Option<ObserveDurability>) -> Self {
        self.observe = requirement.filter(|r| r.is_required());
        self
    }

    pub fn cancel(mut self, signal: Option<&CancelSignal>) -> Self {
        self.cancel = signal.cloned();
        self
    }

    fn is_durable(&self) -> bool {
        self.durability.is_durable() || self.observe.is_some()
    }

    /// Reject settings the store could never satisfy
    pub fn check_ready(&self) -> StoreResult<()> {
        if self.timeout.is_zero() {
            return Err(StoreError::InvalidArgument(format!(
                "{} on {} has a zero timeout",
                self.operation, self.id.key
            )));
        }
        if self.observe.is_some() && self.durability.is_durable() {
            return Err(StoreError::InvalidArgument(
                "cannot mix observe based and level based durability".to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout after applying the durable write floor
    pub fn effective_timeout(&self) -> Duration {
        if self.is_durable() && self.timeout < DURABILITY_TIMEOUT_FLOOR {
            warn!(
                operation = self.operation,
                key = %self.id.key,
                requested_ms = self.timeout.as_millis() as u64,
                floor_ms = DURABILITY_TIMEOUT_FLOOR.as_millis() as u64,
                "Durable operation timeout raised to the minimum"
            );
            return DURABILITY_TIMEOUT_FLOOR;
        }
        self.timeout
    }

    /// Fill in the durability fields of `base`
    pub fn mutate_options(&self, mut base: MutateOptions) -> MutateOptions {
        base.durability = self.durability;
        base.durability_timeout = if self.durability.is_durable() {
            Some(self.effective_timeout().mul_f64(0.9))
        } else {
            None
        };
        base
    }

    /// Run `request` within the deadline and cancellation signal
    pub async fn run<T, F>(&self, request: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.check_ready()?;
        let deadline = Instant::now() + self.effective_timeout();
        self.run_until(deadline, request).await
    }

    async fn run_until<T, F>(&self, deadline: Instant, request: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout_ms = self.effective_timeout().as_millis() as u64;
        let bounded = async {
            match tokio::time::timeout_at(deadline, request).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::timeout(self.operation, timeout_ms)),
            }
        };
        match &self.cancel {
            Some(signal) => {
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => Err(StoreError::Canceled(self.operation.to_string())),
                    result = bounded => result,
                }
            }
            None => bounded.await,
        }
    }

    /// Run a mutation, then wait for its observe durability requirement
    /// within the same deadline
    pub async fn run_observed<F>(
        &self,
        store: &dyn DocumentStore,
        request: F,
    ) -> StoreResult<MutationResult>
    where
        F: Future<Output = StoreResult<MutationResult>>,
    {
        self.check_ready()?;
        let deadline = Instant::now() + self.effective_timeout();
        let result = self.run_until(deadline, request).await?;
        if let Some(requirement) = self.observe {
            self.run_until(
                deadline,
                store.observe_durability(&self.id, result.cas, requirement),
            )
            .await
            .map_err(|e| match e {
                StoreError::Timeout { .. } => StoreError::DurabilityAmbiguous(format!(
                    "{} on {} was applied but not observed",
                    self.operation, self.id.key
                )),
                other => other,
            })?;
        }
        Ok(result)
    }
}
