//! Domain-specific error types for kv-transactions

use thiserror::Error;

/// Failures reported by a [`DocumentStore`](crate::storage::DocumentStore) request
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    Exists(String),
    #[error("cas mismatch on {0}")]
    CasMismatch(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("path already exists: {0}")]
    PathExists(String),
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("{0} was canceled")]
    Canceled(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("durability requirements cannot be met: {0}")]
    DurabilityImpossible(String),
    #[error("durability outcome ambiguous: {0}")]
    DurabilityAmbiguous(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether the request may have failed for reasons unrelated to the
    /// document's state, so a later retry could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. }
                | StoreError::Canceled(_)
                | StoreError::Transport(_)
                | StoreError::DurabilityAmbiguous(_)
        )
    }

    /// Whether the store side effect may or may not have been applied.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout { .. } | StoreError::Canceled(_) | StoreError::DurabilityAmbiguous(_)
        )
    }
}

/// Structured configuration error domain
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{setting}: {reason}")]
    InvalidSetting { setting: String, reason: String },
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    pub fn invalid_setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for ConfigError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}
