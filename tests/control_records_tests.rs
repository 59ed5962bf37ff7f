/// Control record tests
///
/// Concurrent creation and mutation of control records against one store.
/// Run with: cargo test --test control_records_tests

use chrono::{TimeDelta, Utc};
use docstate::storage::{DocumentStore, MemoryDocumentStore};
use docstate::transaction::{AttemptContext, Operation};
use docstate::{
    DocKey, DocState, Result, StateConfig, StateError, StatusLevel, TransactionRunner, TxnPlan,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_converges() {
    let store = Arc::new(MemoryDocumentStore::new());
    let config = StateConfig::default();
    let num_tasks = 16;
    let barrier = Arc::new(Barrier::new(num_tasks));

    let mut handles = vec![];
    for _ in 0..num_tasks {
        let state = DocState::with_stores(config.clone(), store.clone(), Arc::new(docstate::storage::MemoryBlobStore::new()));
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            state.control_records().get_or_create("manager").await
        }));
    }

    let records: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(records.iter().all(|r| *r == records[0]));
    assert_eq!(records[0].revision(), 1);
    assert_eq!(store.scan("controlRecords").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_or_create_race_with_single_attempt_budget() {
    let store = Arc::new(MemoryDocumentStore::new());
    let config = StateConfig::default().max_attempts(1);
    let barrier = Arc::new(Barrier::new(8));

    let mut handles = vec![];
    for _ in 0..8 {
        let records = docstate::ControlRecords::new(store.clone(), &config);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            records.get_or_create("manager").await
        }));
    }
    for handle in handles {
        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.consecutive_errors(), 0);
    }
    assert_eq!(store.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_all_count() {
    let state = Arc::new(DocState::in_memory(StateConfig::default()));
    state.control_records().get_or_create("manager").await.unwrap();

    let num_tasks = 10;
    let increments_per_task = 5;
    let mut handles = vec![];
    for _ in 0..num_tasks {
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move {
            let records = state.control_records();
            let mut record = records.get("manager").await.unwrap();
            for _ in 0..increments_per_task {
                records.increment_errors(&mut record).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let record = state.control_records().get("manager").await.unwrap();
    assert_eq!(record.consecutive_errors(), (num_tasks * increments_per_task) as u64);
}

#[tokio::test]
async fn test_reset_and_increment_last_commit_wins() {
    let state = DocState::in_memory(StateConfig::default());
    let records = state.control_records();
    let mut record = records.get_or_create("manager").await.unwrap();

    records.increment_errors(&mut record).await.unwrap();
    records.record_success(&mut record, Utc::now()).await.unwrap();
    assert_eq!(records.get("manager").await.unwrap().consecutive_errors(), 0);

    // A stale copy still increments the stored value, not its own.
    let mut stale = record.clone();
    records.record_success(&mut record, Utc::now()).await.unwrap();
    records.increment_errors(&mut stale).await.unwrap();
    assert_eq!(stale.consecutive_errors(), 1);
    assert_eq!(records.get("manager").await.unwrap().consecutive_errors(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reset_keeps_later_increments() {
    let state = Arc::new(DocState::in_memory(StateConfig::default()));
    state.control_records().get_or_create("manager").await.unwrap();

    let num_increments = 8;
    let barrier = Arc::new(Barrier::new(num_increments + 1));
    let mut increments = vec![];
    for _ in 0..num_increments {
        let state = Arc::clone(&state);
        let barrier = Arc::clone(&barrier);
        increments.push(tokio::spawn(async move {
            let records = state.control_records();
            let mut record = records.get("manager").await.unwrap();
            barrier.wait().await;
            records.increment_errors(&mut record).await.unwrap();
            record.revision()
        }));
    }
    let reset = {
        let state = Arc::clone(&state);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            let records = state.control_records();
            let mut record = records.get("manager").await.unwrap();
            barrier.wait().await;
            records.record_success(&mut record, Utc::now()).await.unwrap();
            record.revision()
        })
    };

    let reset_revision = reset.await.unwrap();
    let increment_revisions: Vec<u64> = futures::future::join_all(increments)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    // Every commit gets its own revision, so revisions give the commit order.
    let after_reset = increment_revisions.iter().filter(|rev| **rev > reset_revision).count();
    let record = state.control_records().get("manager").await.unwrap();
    assert_eq!(record.consecutive_errors(), after_reset as u64);
    assert_eq!(record.revision(), 1 + num_increments as u64 + 1);
    assert!(record.last_success_time().is_some());
}

#[tokio::test]
async fn test_status_transitions() {
    let state = DocState::in_memory(StateConfig::default());
    let records = state.control_records();
    let mut record = records.get_or_create("manager").await.unwrap();
    let now = Utc::now();

    assert_eq!(records.status(&record, now).level, StatusLevel::Ok);
    for _ in 0..3 {
        records.increment_errors(&mut record).await.unwrap();
    }
    // Never succeeded and at the threshold.
    assert_eq!(records.status(&record, now).level, StatusLevel::Critical);

    records
        .record_success(&mut record, now - TimeDelta::days(7))
        .await
        .unwrap();
    for _ in 0..3 {
        records.increment_errors(&mut record).await.unwrap();
    }
    let status = records.status(&record, now);
    assert_eq!(status.level, StatusLevel::Critical);
    assert_eq!(status.message, "exceeded grace period");

    let status = records.status(&record, now - TimeDelta::seconds(1));
    assert_eq!(status.level, StatusLevel::Degraded);
    assert_eq!(status.message, "errors present, within grace period");
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let store = Arc::new(MemoryDocumentStore::new());
    let key = DocKey::new("controlRecords", "manager");
    let mut fields = docstate::Fields::new();
    fields.insert("consecutive_errors".to_string(), json!(0));
    store
        .submit(&docstate::transaction::TransactionAttempt::new(
            0,
            vec![Operation::insert(key.clone(), fields.clone())],
        ))
        .await
        .unwrap();

    let runner = TransactionRunner::new(store, StateConfig::default().max_attempts(3).retry);
    let builder = |_ctx: &AttemptContext<'_>| -> Result<TxnPlan> {
        Ok(TxnPlan::Submit(vec![Operation::insert(key.clone(), fields.clone())]))
    };
    let err = runner.run("always.insert", builder).await.unwrap_err();
    assert_eq!(err, StateError::RetryExhausted { attempts: 3 });
    assert_eq!(err.class(), docstate::ErrorClass::Retryable);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateConfig::new(dir.path()).checkpoint_threshold(2);

    {
        let state = DocState::open(config.clone()).await.unwrap();
        let records = state.control_records();
        let mut record = records.get_or_create("manager").await.unwrap();
        for _ in 0..5 {
            records.increment_errors(&mut record).await.unwrap();
        }
    }

    let state = DocState::open(config).await.unwrap();
    let record = state.control_records().get("manager").await.unwrap();
    assert_eq!(record.consecutive_errors(), 5);
    assert_eq!(record.revision(), 6);
}
