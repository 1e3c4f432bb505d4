//! Fault-injection hooks
//!
//! Every step of an attempt, of cleanup and of client record maintenance
//! calls into a hook before (or after) touching the store. Production code
//! uses the no-op [`DefaultHooks`]; tests install their own implementation
//! through [`HooksConfig`] to fail a step or simulate a crash at an exact
//! point. A hook returning an error aborts the step with that error.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Stage names passed to [`TransactionHooks::has_expired_client_side`]
pub mod stage {
    pub const GET: &str = "get";
    pub const INSERT: &str = "insert";
    pub const REPLACE: &str = "replace";
    pub const REMOVE: &str = "remove";
    pub const BEFORE_COMMIT: &str = "commit";
    pub const ROLLBACK: &str = "rollback";
}

/// Hooks called by an attempt
#[async_trait]
pub trait TransactionHooks: Send + Sync {
    /// Before the ATR entry is first written (Pending to Staged)
    async fn before_atr_pending(&self, _attempt_id: &str) -> Result<()> {
        Ok(())
    }

    async fn before_staged_insert(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn before_staged_replace(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn before_staged_remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Before the commit point write
    async fn before_atr_commit(&self, _attempt_id: &str) -> Result<()> {
        Ok(())
    }

    /// After the commit point write succeeded
    async fn after_atr_commit(&self, _attempt_id: &str) -> Result<()> {
        Ok(())
    }

    async fn before_doc_committed(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Before the entry moves to Committed
    async fn before_atr_complete(&self, _attempt_id: &str) -> Result<()> {
        Ok(())
    }

    async fn before_atr_rolled_back(&self, _attempt_id: &str) -> Result<()> {
        Ok(())
    }

    async fn before_doc_rolled_back(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Force the client to treat the attempt as expired at `stage`
    async fn has_expired_client_side(&self, _stage: &str, _key: Option<&str>) -> bool {
        false
    }
}

/// Hooks called while cleaning up an attempt
#[async_trait]
pub trait CleanupHooks: Send + Sync {
    async fn before_atr_get(&self, _atr_key: &str) -> Result<()> {
        Ok(())
    }

    async fn before_commit_doc(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn before_rollback_doc(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn before_atr_remove(&self, _attempt_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Hooks called while maintaining the lost-cleanup client record
#[async_trait]
pub trait ClientRecordHooks: Send + Sync {
    async fn before_create_record(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn before_update_record(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn before_remove_client(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }
}

/// No-op implementation of every hook trait
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl TransactionHooks for DefaultHooks {}
impl CleanupHooks for DefaultHooks {}
impl ClientRecordHooks for DefaultHooks {}

/// Hook implementations installed on a manager
#[derive(Clone)]
pub struct HooksConfig {
    pub transaction: Arc<dyn TransactionHooks>,
    pub cleanup: Arc<dyn CleanupHooks>,
    pub client_record: Arc<dyn ClientRecordHooks>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            transaction: Arc::new(DefaultHooks),
            cleanup: Arc::new(DefaultHooks),
            client_record: Arc::new(DefaultHooks),
        }
    }
}

impl fmt::Debug for HooksConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HooksConfig").finish_non_exhaustive()
    }
}
