//! Per-scope control records: a lazily created status document guarded by
//! optimistic transactions.

mod record;

pub use record::{ControlRecord, ControlStatus, StatusLevel};

use crate::config::StateConfig;
use crate::core::{DocKey, Fields, Result, StateError, encode_fields};
use crate::storage::DocumentStore;
use crate::transaction::{
    AttemptContext, Operation, TransactionRunner, TxnOutcome, TxnPlan,
};
use chrono::{DateTime, Utc};
use record::{
    ControlRecordDoc, FIELD_CONSECUTIVE_ERRORS, FIELD_GRACE_PERIOD, FIELD_LAST_SUCCESS,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

/// Access to control records in one collection.
///
/// Holds no record state of its own: every call goes to the store, and the
/// `ControlRecord` values it hands out are caller-owned caches.
#[derive(Clone)]
pub struct ControlRecords {
    runner: TransactionRunner,
    collection: String,
    error_threshold: u64,
    default_grace_period: Duration,
}

impl ControlRecords {
    pub fn new(store: Arc<dyn DocumentStore>, config: &StateConfig) -> Self {
        Self {
            runner: TransactionRunner::new(store, config.retry.clone()),
            collection: config.control_collection.clone(),
            error_threshold: config.error_threshold,
            default_grace_period: config.default_grace_period,
        }
    }

    fn doc_key(&self, key: &str) -> DocKey {
        DocKey::new(self.collection.clone(), key)
    }

    /// Existing record for `key`, or `NotFound`.
    pub async fn get(&self, key: &str) -> Result<ControlRecord> {
        let doc_key = self.doc_key(key);
        match self.runner.fetch(&doc_key).await? {
            Some(doc) => ControlRecord::from_document(key, &doc),
            None => Err(StateError::NotFound(format!("control record '{}'", key))),
        }
    }

    /// Returns the record for `key`, creating it with defaults if absent.
    ///
    /// Concurrent callers converge on one stored record: a caller whose insert
    /// loses the race sees the winner's document on retry and returns it.
    pub async fn get_or_create(&self, key: &str) -> Result<ControlRecord> {
        match self.get(key).await {
            Ok(record) => return Ok(record),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let doc_key = self.doc_key(key);
        let defaults = encode_fields(&ControlRecordDoc::with_grace_period(self.default_grace_period))?;
        let builder = |ctx: &AttemptContext<'_>| -> Result<TxnPlan> {
            if ctx.prior.is_some_and(|prior| prior.exists(&doc_key)) {
                return Ok(TxnPlan::Satisfied);
            }
            Ok(TxnPlan::Submit(vec![Operation::insert(doc_key.clone(), defaults.clone())]))
        };

        match self.runner.run("control.create", builder).await? {
            TxnOutcome::Committed { receipt, .. } => {
                let doc = receipt.document(&doc_key).ok_or_else(|| {
                    StateError::Fatal(format!("store did not return inserted {}", doc_key))
                })?;
                event!(Level::INFO, key, "control record created");
                ControlRecord::from_document(key, doc)
            }
            TxnOutcome::Satisfied { .. } => {
                event!(Level::DEBUG, key, "control record created concurrently");
                self.get(key).await
            }
        }
    }

    /// Re-reads `record` from the store.
    pub async fn refresh(&self, record: &mut ControlRecord) -> Result<()> {
        *record = self.get(record.key()).await?;
        Ok(())
    }

    /// Sets the last success time (stored as UTC) and resets the error counter.
    pub async fn record_success(&self, record: &mut ControlRecord, at: DateTime<Utc>) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert(FIELD_LAST_SUCCESS.to_string(), serde_json::to_value(at.with_timezone(&Utc))?);
        fields.insert(FIELD_CONSECUTIVE_ERRORS.to_string(), Value::from(0u64));
        self.update(record, "control.success", Operation::set_fields(self.doc_key(record.key()), fields))
            .await
    }

    /// Adds one to the error counter with a store-side increment, so concurrent
    /// increments from any number of callers all count.
    pub async fn increment_errors(&self, record: &mut ControlRecord) -> Result<()> {
        let op = Operation::increment(self.doc_key(record.key()), FIELD_CONSECUTIVE_ERRORS, 1);
        self.update(record, "control.increment", op).await
    }

    pub async fn set_grace_period(&self, record: &mut ControlRecord, period: Duration) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert(FIELD_GRACE_PERIOD.to_string(), Value::from(period.as_secs()));
        self.update(record, "control.grace", Operation::set_fields(self.doc_key(record.key()), fields))
            .await
    }

    /// Status of `record` as of `now`, using the configured error threshold.
    pub fn status(&self, record: &ControlRecord, now: DateTime<Utc>) -> ControlStatus {
        record.status_at(now, self.error_threshold)
    }

    /// Runs a single guarded update and refreshes the cache from the committed image.
    async fn update(&self, record: &mut ControlRecord, label: &str, op: Operation) -> Result<()> {
        let doc_key = op.key.clone();
        let builder = |ctx: &AttemptContext<'_>| -> Result<TxnPlan> {
            if ctx.prior.is_some_and(|prior| !prior.exists(&doc_key)) {
                return Err(StateError::NotFound(format!("control record '{}'", doc_key.id)));
            }
            Ok(TxnPlan::Submit(vec![op.clone()]))
        };

        let outcome = self.runner.run(label, builder).await?;
        let doc = outcome
            .receipt()
            .and_then(|receipt| receipt.document(&doc_key))
            .ok_or_else(|| StateError::Fatal(format!("store did not return updated {}", doc_key)))?;
        *record = ControlRecord::from_document(record.key(), doc)?;
        Ok(())
    }
}
