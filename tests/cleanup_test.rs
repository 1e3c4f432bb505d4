//! Cleanup Integration Tests
//!
//! Attempts that stop making progress after staging are finalized by
//! somebody else:
//!
//! - the client's own cleanup queue, for attempts handed off after the
//!   commit point
//! - the lost-attempt sweeper, for attempts whose client went away

mod common;

use async_trait::async_trait;
use common::*;
use kv_transactions::hooks::{CleanupHooks, TransactionHooks};
use kv_transactions::{
    CleanupOutcome, HooksConfig, Result, TransactionError, TransactionOptions,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails the step right after the commit point while armed
#[derive(Default)]
struct CrashAfterCommit {
    armed: AtomicBool,
}

impl CrashAfterCommit {
    fn armed() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl TransactionHooks for CrashAfterCommit {
    async fn after_atr_commit(&self, attempt_id: &str) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(TransactionError::Injected(format!(
                "crash after commit point of {attempt_id}"
            )));
        }
        Ok(())
    }
}

fn crash_hooks() -> HooksConfig {
    HooksConfig {
        transaction: CrashAfterCommit::armed(),
        ..Default::default()
    }
}

/// Stage a replace of `key` and commit it with unstaging cut short
async fn commit_interrupted(h: &Harness, key: &str, options: Option<TransactionOptions>) {
    let mut txn = h.manager.begin_transaction(options).unwrap();
    txn.begin_attempt().unwrap();
    let doc = txn.get(&h.coll, key).await.unwrap();
    txn.replace(&doc, json!({"v": "committed"})).await.unwrap();
    let result = txn.commit().await.unwrap();
    assert!(!result.unstaging_complete);
}

// ============================================================================
// Cleanup queue
// ============================================================================

#[tokio::test]
async fn test_forced_queue_drain_finishes_commit() {
    let h = harness_with_hooks(crash_hooks());
    h.coll.insert("k", json!({"v": "before"})).await.unwrap();

    commit_interrupted(&h, "k", None).await;

    // Commit point reached but nothing unstaged yet
    assert_eq!(h.body("k"), Some(json!({"v": "before"})));
    assert!(h.has_marker("k"));
    assert_eq!(h.manager.cleanup_queue_length(), 1);

    let reports = h.manager.force_cleanup_queue().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].success());
    assert_eq!(reports[0].outcome, Some(CleanupOutcome::Committed));

    assert_eq!(h.body("k"), Some(json!({"v": "committed"})));
    assert!(!h.has_marker("k"));
    assert!(h.atr_keys().is_empty());

    // Running again finds nothing left to do
    assert_eq!(h.manager.cleanup_queue_length(), 0);
    assert!(h.manager.force_cleanup_queue().await.is_empty());

    h.manager.close().await;
}

/// Fails the removal of an ATR entry while armed
#[derive(Default)]
struct FailEntryRemoval {
    armed: AtomicBool,
}

#[async_trait]
impl CleanupHooks for FailEntryRemoval {
    async fn before_atr_remove(&self, attempt_id: &str) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(TransactionError::Injected(format!(
                "lost connection before removing {attempt_id}"
            )));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_queue_replays_entry_left_committed() {
    let removal = Arc::new(FailEntryRemoval {
        armed: AtomicBool::new(true),
    });
    let h = harness_with(|config| {
        config.hooks = HooksConfig {
            cleanup: removal.clone(),
            ..crash_hooks()
        };
        config.cleanup_max_retries = 3;
        config.cleanup_retry_delay = Duration::from_secs(3600);
    });
    h.coll.insert("k", json!({"v": "before"})).await.unwrap();

    commit_interrupted(&h, "k", None).await;

    // Documents get unstaged and the entry reaches Committed, but it stays
    let reports = h.manager.force_cleanup_queue().await;
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].success());
    assert_eq!(h.body("k"), Some(json!({"v": "committed"})));
    assert!(!h.has_marker("k"));
    assert_eq!(h.atr_keys().len(), 1);
    assert_eq!(h.manager.cleanup_queue_length(), 1);

    removal.armed.store(false, Ordering::SeqCst);
    let reports = h.manager.force_cleanup_queue().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].success());
    assert_eq!(reports[0].outcome, Some(CleanupOutcome::EntryRemoved));

    assert_eq!(h.body("k"), Some(json!({"v": "committed"})));
    assert!(h.atr_keys().is_empty());
    assert_eq!(h.manager.cleanup_queue_length(), 0);

    h.manager.close().await;
}

#[tokio::test]
async fn test_queue_worker_cleans_after_expiry() {
    let h = harness_with(|config| {
        config.hooks = crash_hooks();
        config.cleanup_grace = Duration::ZERO;
    });
    h.coll.insert("k", json!({"v": "before"})).await.unwrap();

    let options = TransactionOptions::new().expiration_time(Duration::from_millis(100));
    commit_interrupted(&h, "k", Some(options)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.has_marker("k") && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(h.body("k"), Some(json!({"v": "committed"})));
    assert!(!h.has_marker("k"));
    assert_eq!(h.manager.cleanup_queue_length(), 0);

    h.manager.close().await;
}

#[tokio::test]
async fn test_blocked_writer_cleans_expired_blocker() {
    let h = harness();
    h.coll.insert("k", json!({"v": 0})).await.unwrap();

    let options = TransactionOptions::new().expiration_time(Duration::from_millis(500));
    let mut abandoned = h.manager.begin_transaction(Some(options)).unwrap();
    abandoned.begin_attempt().unwrap();
    let doc = abandoned.get(&h.coll, "k").await.unwrap();
    abandoned.replace(&doc, json!({"v": 1})).await.unwrap();
    drop(abandoned);

    h.store.advance_clock(Duration::from_secs(2));

    let mut txn = h.manager.begin_transaction(None).unwrap();
    txn.begin_attempt().unwrap();
    let doc = txn.get(&h.coll, "k").await.unwrap();
    assert_eq!(doc.value, json!({"v": 0}));
    txn.replace(&doc, json!({"v": 2})).await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(h.body("k"), Some(json!({"v": 2})));
    h.manager.close().await;
}

// ============================================================================
// Lost-attempt sweeper
// ============================================================================

fn sweeper_only(config: &mut kv_transactions::TransactionsConfig) {
    config.cleanup_client_attempts = false;
    // Keep the background loop from reaching the test's shard first
    config.cleanup_window = Duration::from_secs(3600);
}

#[tokio::test]
async fn test_sweeper_rolls_back_abandoned_attempt() {
    let h = harness_with(sweeper_only);
    h.coll.insert("k", json!({"v": "before"})).await.unwrap();

    let options = TransactionOptions::new().expiration_time(Duration::from_secs(1));
    let mut txn = h.manager.begin_transaction(Some(options)).unwrap();
    txn.begin_attempt().unwrap();
    let doc = txn.get(&h.coll, "k").await.unwrap();
    txn.replace(&doc, json!({"v": "never"})).await.unwrap();
    drop(txn);

    let sweeper = h.manager.lost_cleanup().unwrap();
    assert!(sweeper.locations().contains(&h.coll.location()));

    let report = sweeper.sweep_location_once(&h.coll.location()).await.unwrap();
    assert_eq!(report.attempts_cleaned, 0);
    assert!(h.has_marker("k"));

    h.store.advance_clock(Duration::from_secs(5));
    let report = sweeper.sweep_location_once(&h.coll.location()).await.unwrap();
    assert_eq!(report.attempts_found, 1);
    assert_eq!(report.attempts_cleaned, 1);

    assert_eq!(h.body("k"), Some(json!({"v": "before"})));
    assert!(!h.has_marker("k"));
    assert!(h.atr_keys().is_empty());

    h.manager.close().await;
}

#[tokio::test]
async fn test_sweeper_completes_commit_after_crash() {
    let h = harness_with(|config| {
        sweeper_only(config);
        config.hooks = crash_hooks();
    });
    h.coll.insert("k", json!({"v": "before"})).await.unwrap();

    let options = TransactionOptions::new().expiration_time(Duration::from_secs(1));
    commit_interrupted(&h, "k", Some(options)).await;
    assert_eq!(h.manager.cleanup_queue_length(), 0);
    assert!(h.has_marker("k"));

    h.store.advance_clock(Duration::from_secs(5));
    let sweeper = h.manager.lost_cleanup().unwrap();
    let report = sweeper.sweep_location_once(&h.coll.location()).await.unwrap();
    assert_eq!(report.attempts_cleaned, 1);

    assert_eq!(h.body("k"), Some(json!({"v": "committed"})));
    assert!(!h.has_marker("k"));
    assert!(h.atr_keys().is_empty());

    // A second pass is a no-op
    let report = sweeper.sweep_location_once(&h.coll.location()).await.unwrap();
    assert_eq!(report.attempts_found, 0);

    h.manager.close().await;
}

#[tokio::test]
async fn test_close_removes_client_from_record() {
    let h = harness_with(sweeper_only);
    h.coll.insert("k", json!(1)).await.unwrap();

    let mut txn = h.manager.begin_transaction(None).unwrap();
    txn.begin_attempt().unwrap();
    let doc = txn.get(&h.coll, "k").await.unwrap();
    txn.replace(&doc, json!(2)).await.unwrap();
    txn.commit().await.unwrap();

    let sweeper = h.manager.lost_cleanup().unwrap().clone();
    sweeper.sweep_location_once(&h.coll.location()).await.unwrap();

    let record_id = h.id(kv_transactions::cleanup::CLIENT_RECORD_KEY);
    let client_path = |doc: &kv_transactions::storage::RawDocument| {
        doc.xattrs["records"]["clients"]
            .get(sweeper.client_id())
            .is_some()
    };
    let record = h.store.raw_document(&record_id).unwrap();
    assert!(client_path(&record));

    h.manager.close().await;

    let record = h.store.raw_document(&record_id).unwrap();
    assert!(!client_path(&record));
}
