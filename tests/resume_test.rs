//! Resumable attempt tests
//!
//! An attempt serialized in one place must come back with the same
//! identity, expiry budget, durability and ATR location, and corrupt
//! snapshots must be rejected before anything touches the store.

mod common;

use common::*;
use kv_transactions::{AttemptState, DurabilityLevel, TransactionError, TransactionOptions};
use serde_json::{json, Value};
use std::time::Duration;

async fn staged_snapshot(h: &Harness) -> (Vec<u8>, kv_transactions::AtrLocation, String) {
    h.coll.insert("item:42", json!({"stock": 10})).await.unwrap();

    let mut txn = h.manager.begin_transaction(None).unwrap();
    txn.begin_attempt().unwrap();
    txn.insert(&h.coll, "order:1", json!({"item": 42})).await.unwrap();
    let item = txn.get(&h.coll, "item:42").await.unwrap();
    txn.replace(&item, json!({"stock": 9})).await.unwrap();

    let bytes = txn.serialize_attempt().unwrap();
    let atr = txn.atr_location().cloned().unwrap();
    (bytes, atr, txn.attempt_id().unwrap().to_string())
}

fn tamper(bytes: &[u8], edit: impl FnOnce(&mut Value)) -> Vec<u8> {
    let mut value: Value = serde_json::from_slice(bytes).unwrap();
    edit(&mut value);
    serde_json::to_vec(&value).unwrap()
}

#[tokio::test]
async fn test_resumed_attempt_commits() {
    let h = harness();
    let (bytes, atr, attempt_id) = staged_snapshot(&h).await;

    let mut resumed = h.manager.resume_transaction_attempt(&bytes, None).unwrap();
    assert_eq!(resumed.attempt_id(), Some(attempt_id.as_str()));
    assert_eq!(resumed.atr_location(), Some(&atr));
    assert_eq!(resumed.durability(), DurabilityLevel::None);
    assert_eq!(resumed.attempt().unwrap().state(), AttemptState::Staged);
    assert_eq!(resumed.attempt().unwrap().mutations().len(), 2);
    assert!(resumed.time_left() <= Duration::from_secs(5));
    assert!(resumed.time_left() > Duration::ZERO);

    let result = resumed.commit().await.unwrap();
    assert!(result.unstaging_complete);

    assert_eq!(h.body("order:1"), Some(json!({"item": 42})));
    assert_eq!(h.body("item:42"), Some(json!({"stock": 9})));
    assert!(!h.has_marker("item:42"));
    assert!(h.atr_keys().is_empty());

    h.manager.close().await;
}

#[tokio::test]
async fn test_resumed_attempt_rolls_back() {
    let h = harness();
    let (bytes, _, _) = staged_snapshot(&h).await;

    let mut resumed = h.manager.resume_transaction_attempt(&bytes, None).unwrap();
    resumed.rollback().await.unwrap();

    assert!(h.coll.get("order:1").await.is_err());
    assert_eq!(h.body("item:42"), Some(json!({"stock": 10})));
    assert!(h.atr_keys().is_empty());

    h.manager.close().await;
}

#[tokio::test]
async fn test_snapshot_round_trips() {
    let h = harness();
    let (bytes, _, _) = staged_snapshot(&h).await;

    let resumed = h.manager.resume_transaction_attempt(&bytes, None).unwrap();
    let again = resumed.serialize_attempt().unwrap();

    let first = kv_transactions::AttemptSnapshot::from_bytes(&bytes).unwrap();
    let second = kv_transactions::AttemptSnapshot::from_bytes(&again).unwrap();
    assert_eq!(first.attempt_id, second.attempt_id);
    assert_eq!(first.atr, second.atr);
    assert_eq!(first.durability, second.durability);
    assert_eq!(first.num_atrs, second.num_atrs);
    assert_eq!(first.mutations, second.mutations);
    assert!(second.time_left <= first.time_left);

    h.manager.close().await;
}

#[tokio::test]
async fn test_rejects_zero_time_left() {
    let h = harness();
    let (bytes, _, _) = staged_snapshot(&h).await;
    let bad = tamper(&bytes, |v| v["state"]["timeLeftMs"] = json!(0));

    let err = h.manager.resume_transaction_attempt(&bad, None).unwrap_err();
    assert!(matches!(err, TransactionError::InvalidSnapshot(_)));
    h.manager.close().await;
}

#[tokio::test]
async fn test_rejects_out_of_range_shard_count() {
    let h = harness();
    let (bytes, _, _) = staged_snapshot(&h).await;
    let bad = tamper(&bytes, |v| v["config"]["numAtrs"] = json!(2000));

    let err = h.manager.resume_transaction_attempt(&bad, None).unwrap_err();
    assert!(matches!(err, TransactionError::InvalidSnapshot(_)));
    h.manager.close().await;
}

#[tokio::test]
async fn test_rejects_missing_fields_and_garbage() {
    let h = harness();
    let (bytes, _, _) = staged_snapshot(&h).await;

    let no_atr = tamper(&bytes, |v| {
        v.as_object_mut().unwrap().remove("atr");
    });
    assert!(matches!(
        h.manager.resume_transaction_attempt(&no_atr, None),
        Err(TransactionError::InvalidSnapshot(_))
    ));

    let no_ids = tamper(&bytes, |v| {
        v.as_object_mut().unwrap().remove("id");
    });
    assert!(matches!(
        h.manager.resume_transaction_attempt(&no_ids, None),
        Err(TransactionError::InvalidSnapshot(_))
    ));

    assert!(matches!(
        h.manager.resume_transaction_attempt(b"not json", None),
        Err(TransactionError::InvalidSnapshot(_))
    ));
    h.manager.close().await;
}

#[tokio::test]
async fn test_serialize_requires_live_attempt() {
    let h = harness();
    let mut txn = h
        .manager
        .begin_transaction(Some(TransactionOptions::new()))
        .unwrap();
    assert!(matches!(
        txn.serialize_attempt(),
        Err(TransactionError::IllegalState(_))
    ));

    txn.begin_attempt().unwrap();
    txn.commit().await.unwrap();
    assert!(matches!(
        txn.serialize_attempt(),
        Err(TransactionError::IllegalState(_))
    ));
    h.manager.close().await;
}
