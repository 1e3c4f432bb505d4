//! # kv-transactions
//!
//! Atomic multi-document transactions over any key-value store that offers
//! per-document compare-and-swap, partial-document mutation, metadata paths
//! (xattrs) and durability acknowledgment.
//!
//! Writes are staged as metadata beside the visible body of each document
//! and committed by a single CAS on an Active Transaction Record (ATR).
//! Every actor can inspect an ATR, so an attempt abandoned by a crashed
//! process is finalized by whichever client finds it once it has expired.
//!
//! ## Features
//!
//! - **Read-committed isolation**: staged content is never visible outside
//!   the attempt that wrote it
//! - **Write-write conflict detection**: a second writer sees the staging
//!   marker and backs off until the first attempt resolves
//! - **Commit point**: once the ATR entry moves to `Committing` the
//!   transaction is guaranteed to become fully visible, by this process or
//!   by cleanup
//! - **Background cleanup**: a per-process queue for attempts handed off
//!   after the commit point, plus a lost-attempt sweeper shared between
//!   clients via client records
//! - **Resumable attempts**: an attempt can be serialized and finished by
//!   another process
//!
//! ## Quick Start
//!
//! ```no_run
//! use kv_transactions::{
//!     Collection, DurabilityLevel, MemoryStore, Result, StaticResolver, TransactionsConfig,
//!     TransactionsManager,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = Arc::new(MemoryStore::new("default"));
//!     let mut config = TransactionsConfig::default()
//!         .with_resolver(Arc::new(StaticResolver::new().with_store(store.clone())));
//!     config.durability_level = DurabilityLevel::None;
//!     let manager = TransactionsManager::new(config)?;
//!     let coll = Collection::default_collection(store);
//!
//!     let result = manager
//!         .run(
//!             |txn| {
//!                 let coll = coll.clone();
//!                 Box::pin(async move {
//!                     txn.insert(&coll, "order:1", json!({"item": 42})).await?;
//!                     let item = txn.get(&coll, "item:42").await?;
//!                     txn.replace(&item, json!({"stock": 9})).await?;
//!                     Ok(())
//!                 })
//!             },
//!             None,
//!         )
//!         .await?;
//!     assert!(result.unstaging_complete);
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod atr;
pub mod attempt;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod snapshot;
pub mod storage;
pub mod transaction;

pub use atr::{AtrLocation, AttemptState, StagedKind};
pub use attempt::{Attempt, TransactionGetResult, TransactionResult};
pub use cleanup::{CleanupAttempt, CleanupOutcome, LostCleanup, SweepReport};
pub use config::{ConfigFile, DurabilityLevel, TransactionOptions, TransactionsConfig};
pub use error::{ErrorClass, Result, TransactionError};
pub use hooks::{CleanupHooks, ClientRecordHooks, DefaultHooks, HooksConfig, TransactionHooks};
pub use manager::TransactionsManager;
pub use snapshot::AttemptSnapshot;
pub use storage::{
    cancellation, CancelHandle, CancelSignal, Cas, Collection, DocumentId, DocumentLocation,
    DocumentStore, MemoryStore, StaticResolver, StoreResolver,
};
pub use transaction::Transaction;
