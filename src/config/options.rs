//! Per-transaction configuration overrides

use crate::config::{DurabilityLevel, TransactionsConfig};
use crate::error::{ConfigError, Result};
use crate::storage::{CancelSignal, DocumentLocation, StoreResolver};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Overrides applied to a single transaction
///
/// Unset fields inherit from [`TransactionsConfig`].
#[derive(Clone, Default)]
pub struct TransactionOptions {
    pub expiration_time: Option<Duration>,
    pub durability_level: Option<DurabilityLevel>,
    pub kv_timeout: Option<Duration>,
    pub custom_atr_location: Option<DocumentLocation>,
    pub resolver: Option<Arc<dyn StoreResolver>>,
    /// Cancels every in-flight store request of the transaction
    pub cancel: Option<CancelSignal>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiration_time(mut self, expiration: Duration) -> Self {
        self.expiration_time = Some(expiration);
        self
    }

    pub fn durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = Some(level);
        self
    }

    pub fn kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    pub fn custom_atr_location(mut self, location: DocumentLocation) -> Self {
        self.custom_atr_location = Some(location);
        self
    }

    pub fn cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Reject explicit zero durations
    pub fn validate(&self) -> Result<()> {
        if self.expiration_time.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid_setting("expiration_time", "must be positive").into());
        }
        if self.kv_timeout.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid_setting("kv_timeout", "must be positive").into());
        }
        Ok(())
    }

    /// Resolve every override against the process-wide configuration
    pub(crate) fn apply(&self, config: &TransactionsConfig) -> EffectiveOptions {
        EffectiveOptions {
            expiration_time: self.expiration_time.unwrap_or(config.expiration_time),
            durability_level: self.durability_level.unwrap_or(config.durability_level),
            kv_timeout: self.kv_timeout.unwrap_or(config.kv_timeout),
            custom_atr_location: self
                .custom_atr_location
                .clone()
                .or_else(|| config.custom_atr_location.clone()),
        }
    }
}

/// Options after merging overrides with the manager configuration
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EffectiveOptions {
    pub expiration_time: Duration,
    pub durability_level: DurabilityLevel,
    pub kv_timeout: Duration,
    pub custom_atr_location: Option<DocumentLocation>,
}

impl fmt::Debug for TransactionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionOptions")
            .field("expiration_time", &self.expiration_time)
            .field("durability_level", &self.durability_level)
            .field("kv_timeout", &self.kv_timeout)
            .field("custom_atr_location", &self.custom_atr_location)
            .field("has_resolver", &self.resolver.is_some())
            .field("has_cancel", &self.cancel.is_some())
            .finish()
    }
}
