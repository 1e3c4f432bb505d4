//! Error types for kv-transactions
//!
//! Every failure is mapped onto an [`ErrorClass`] which decides how it
//! propagates: conflicts and transient failures before the commit point are
//! reported to the caller (and may be retried with a brand-new attempt),
//! expiry fails fast, validation errors fail at the API boundary.

use thiserror::Error;

mod domain;

pub use domain::{ConfigError, StoreError};

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// How an error should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Write-write conflict or CAS mismatch; recoverable with a new attempt
    Conflict,
    /// The attempt ran out of time
    Expiry,
    /// Timeout, cancellation or transport failure
    Transient,
    /// Malformed input or configuration
    Validation,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Conflict => write!(f, "conflict"),
            ErrorClass::Expiry => write!(f, "expiry"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for kv-transactions
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("write-write conflict on {key}: staged by attempt {blocking_attempt}")]
    WriteWriteConflict {
        key: String,
        blocking_attempt: String,
    },

    #[error("document {0} changed since it was read")]
    CasMismatch(String),

    #[error("document already exists: {0}")]
    DocumentExists(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("attempt {0} has expired")]
    AttemptExpired(String),

    #[error("attempt {attempt_id} was moved to {state} by another actor")]
    AttemptAbortedExternally { attempt_id: String, state: String },

    #[error("commit point outcome for attempt {0} is unknown")]
    CommitAmbiguous(String),

    #[error("illegal attempt state: {0}")]
    IllegalState(String),

    #[error("a previous operation in this attempt failed: {cause}")]
    PreviousOperationFailed {
        cause: String,
        class: ErrorClass,
        retryable: bool,
    },

    #[error("transaction failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: Box<TransactionError>,
    },

    #[error("invalid attempt snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("injected failure: {0}")]
    Injected(String),

    #[error("transactions manager is shut down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransactionError {
    /// Create a configuration error with context
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        TransactionError::Config(ConfigError::invalid_setting(setting, reason))
    }

    /// Create a snapshot validation error
    pub fn invalid_snapshot(reason: impl Into<String>) -> Self {
        TransactionError::InvalidSnapshot(reason.into())
    }

    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            TransactionError::WriteWriteConflict { .. }
            | TransactionError::CasMismatch(_)
            | TransactionError::DocumentExists(_)
            | TransactionError::AttemptAbortedExternally { .. } => ErrorClass::Conflict,
            TransactionError::AttemptExpired(_) => ErrorClass::Expiry,
            TransactionError::Store(e) if e.is_transient() => ErrorClass::Transient,
            TransactionError::Store(StoreError::CasMismatch(_)) => ErrorClass::Conflict,
            TransactionError::Injected(_) | TransactionError::CommitAmbiguous(_) => {
                ErrorClass::Transient
            }
            TransactionError::InvalidSnapshot(_)
            | TransactionError::Config(_)
            | TransactionError::Serialization(_) => ErrorClass::Validation,
            TransactionError::Failed { source, .. } => source.class(),
            TransactionError::PreviousOperationFailed { class, .. } => *class,
            _ => ErrorClass::Internal,
        }
    }

    /// Whether a brand-new attempt of the same transaction may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::DocumentExists(_) | TransactionError::CommitAmbiguous(_) => {
                return false
            }
            TransactionError::PreviousOperationFailed { retryable, .. } => return *retryable,
            TransactionError::Failed { source, .. } => return source.is_retryable(),
            _ => {}
        }
        matches!(self.class(), ErrorClass::Conflict | ErrorClass::Transient)
    }

    /// Whether this is a write-write conflict
    pub fn is_write_write_conflict(&self) -> bool {
        matches!(self, TransactionError::WriteWriteConflict { .. })
    }
}
