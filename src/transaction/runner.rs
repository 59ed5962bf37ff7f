// ============================================================================
// Optimistic Transaction Runner
// ============================================================================
//
// Builds an attempt, submits it, and on conflict hands the builder what the
// store looks like now so it can decide whether to try again or whether a
// racing caller already did the work. Store failures other than conflicts
// are returned immediately.
//
// ============================================================================

use super::{CommitReceipt, Operation, TransactionAttempt};
use crate::core::{DocKey, Document, Result, StateError};
use crate::storage::{DocumentStore, bounded};
use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// Bounds on conflict retries and on each individual store call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of submissions for one transaction.
    pub max_attempts: usize,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
    /// Deadline applied to every store call. Expiry is reported as `Timeout`.
    pub op_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
            op_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    fn backoff_ms(&self, attempt: usize) -> u64 {
        let base = self.base_backoff_ms.max(1);
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }
}

/// What the runner saw after an attempt was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub failed: TransactionAttempt,
    pub op_index: usize,
    pub reason: String,
    /// Document count per key touched by the failed attempt, re-read after the conflict.
    pub counts: BTreeMap<DocKey, u64>,
}

impl Observation {
    pub fn exists(&self, key: &DocKey) -> bool {
        self.counts.get(key).copied().unwrap_or(0) > 0
    }
}

/// Input to a builder: the attempt number and, from the second attempt on,
/// what was observed after the previous one conflicted.
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub sequence_number: usize,
    pub prior: Option<&'a Observation>,
}

impl AttemptContext<'_> {
    pub fn is_retry(&self) -> bool {
        self.sequence_number > 0
    }
}

/// Builder verdict for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnPlan {
    Submit(Vec<Operation>),
    /// Nothing left to do; the intended effect is already in the store.
    Satisfied,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxnOutcome {
    Committed { attempts: usize, receipt: CommitReceipt },
    Satisfied { attempts: usize },
}

impl TxnOutcome {
    pub fn receipt(&self) -> Option<&CommitReceipt> {
        match self {
            Self::Committed { receipt, .. } => Some(receipt),
            Self::Satisfied { .. } => None,
        }
    }
}

/// Produces the operations for an attempt. Implemented for plain closures.
pub trait TxnBuilder: Send + Sync {
    fn build(&self, ctx: &AttemptContext<'_>) -> Result<TxnPlan>;
}

impl<F> TxnBuilder for F
where
    F: Fn(&AttemptContext<'_>) -> Result<TxnPlan> + Send + Sync,
{
    fn build(&self, ctx: &AttemptContext<'_>) -> Result<TxnPlan> {
        self(ctx)
    }
}

#[derive(Clone)]
pub struct TransactionRunner {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
}

impl TransactionRunner {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deadline-bounded fetch.
    pub async fn fetch(&self, key: &DocKey) -> Result<Option<Document>> {
        bounded(self.policy.op_timeout, "fetch", self.store.fetch(key)).await
    }

    /// Runs `builder` until an attempt commits, the builder reports the work
    /// as already done, or the retry budget runs out.
    ///
    /// When the last permitted attempt conflicts, the builder still gets one
    /// look at the observation so a benign race is not reported as an error.
    pub async fn run<B: TxnBuilder>(&self, label: &str, builder: B) -> Result<TxnOutcome> {
        let span = info_span!("txn.run", txn = %label);
        self.run_inner(label, builder).instrument(span).await
    }

    async fn run_inner<B: TxnBuilder>(&self, label: &str, builder: B) -> Result<TxnOutcome> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut prior: Option<Observation> = None;

        for sequence_number in 0..=max_attempts {
            let ctx = AttemptContext {
                sequence_number,
                prior: prior.as_ref(),
            };
            let operations = match builder.build(&ctx)? {
                TxnPlan::Satisfied => {
                    event!(Level::DEBUG, sequence_number, "transaction already satisfied");
                    return Ok(TxnOutcome::Satisfied {
                        attempts: sequence_number,
                    });
                }
                TxnPlan::Submit(_) if sequence_number == max_attempts => {
                    event!(Level::WARN, attempts = max_attempts, "transaction retry budget exhausted");
                    return Err(StateError::RetryExhausted {
                        attempts: max_attempts,
                    });
                }
                TxnPlan::Submit(operations) => operations,
            };
            if operations.is_empty() {
                return Err(StateError::InvalidInput(format!(
                    "transaction '{}' produced no operations",
                    label
                )));
            }

            let attempt = TransactionAttempt::new(sequence_number, operations);
            let submitted = bounded(self.policy.op_timeout, "submit", self.store.submit(&attempt)).await;
            match submitted {
                Ok(receipt) => {
                    event!(Level::DEBUG, sequence_number, "transaction committed");
                    return Ok(TxnOutcome::Committed {
                        attempts: sequence_number + 1,
                        receipt,
                    });
                }
                Err(StateError::Conflict { op_index, reason }) => {
                    let attempt_no = sequence_number + 1;
                    warn!(
                        "transaction '{}' conflict on attempt {} of {}: op {}: {}",
                        label, attempt_no, max_attempts, op_index, reason
                    );
                    prior = Some(self.observe(attempt, op_index, reason).await?);
                    if attempt_no < max_attempts {
                        let backoff = self.policy.backoff_ms(attempt_no);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
                Err(err) => {
                    event!(Level::ERROR, error = %err, "transaction failed");
                    return Err(err);
                }
            }
        }

        Err(StateError::RetryExhausted {
            attempts: max_attempts,
        })
    }

    async fn observe(
        &self,
        failed: TransactionAttempt,
        op_index: usize,
        reason: String,
    ) -> Result<Observation> {
        let mut counts = BTreeMap::new();
        for key in failed.touched_keys() {
            let count = bounded(self.policy.op_timeout, "count", self.store.count(&key)).await?;
            counts.insert(key, count);
        }
        Ok(Observation {
            failed,
            op_index,
            reason,
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Fields;
    use crate::storage::memory::MemoryDocumentStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Scripted {
        Commit,
        Conflict,
        Fatal,
        Hang,
    }

    /// Store that answers submits from a script and reports every key as present.
    struct ScriptedStore {
        script: Mutex<VecDeque<Scripted>>,
        submits: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                submits: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DocumentStore for ScriptedStore {
        async fn fetch(&self, _key: &DocKey) -> Result<Option<Document>> {
            Ok(None)
        }

        async fn count(&self, _key: &DocKey) -> Result<u64> {
            Ok(1)
        }

        async fn scan(&self, _collection: &str) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }

        async fn submit(&self, _attempt: &TransactionAttempt) -> Result<CommitReceipt> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Commit) | None => Ok(CommitReceipt::default()),
                Some(Scripted::Conflict) => Err(StateError::conflict(0, "scripted")),
                Some(Scripted::Fatal) => Err(StateError::Fatal("scripted outage".into())),
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(CommitReceipt::default())
                }
            }
        }
    }

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            op_timeout: Some(Duration::from_millis(200)),
        }
    }

    fn always_submit(_ctx: &AttemptContext<'_>) -> Result<TxnPlan> {
        Ok(TxnPlan::Submit(vec![Operation::insert(
            DocKey::new("c", "a"),
            Fields::new(),
        )]))
    }

    #[tokio::test]
    async fn test_conflict_then_commit() {
        let store = ScriptedStore::new(vec![Scripted::Conflict, Scripted::Commit]);
        let runner = TransactionRunner::new(store.clone(), fast_policy(3));
        let outcome = runner.run("test", always_submit).await.unwrap();
        assert!(matches!(outcome, TxnOutcome::Committed { attempts: 2, .. }));
        assert_eq!(store.submits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let store = ScriptedStore::new(vec![Scripted::Fatal, Scripted::Commit]);
        let runner = TransactionRunner::new(store.clone(), fast_policy(3));
        let err = runner.run("test", always_submit).await.unwrap_err();
        assert!(matches!(err, StateError::Fatal(_)));
        assert_eq!(store.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let store = ScriptedStore::new(vec![Scripted::Conflict, Scripted::Conflict, Scripted::Conflict]);
        let runner = TransactionRunner::new(store.clone(), fast_policy(3));
        let err = runner.run("test", always_submit).await.unwrap_err();
        assert_eq!(err, StateError::RetryExhausted { attempts: 3 });
        assert_eq!(store.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let store = ScriptedStore::new(vec![Scripted::Hang, Scripted::Commit]);
        let runner = TransactionRunner::new(store.clone(), fast_policy(3));
        let err = runner.run("test", always_submit).await.unwrap_err();
        assert!(matches!(err, StateError::Timeout(_)));
        assert_eq!(store.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_builder_sees_observation_on_retry() {
        let store = ScriptedStore::new(vec![Scripted::Conflict]);
        let runner = TransactionRunner::new(store.clone(), fast_policy(1));
        let key = DocKey::new("c", "a");
        let builder = |ctx: &AttemptContext<'_>| -> Result<TxnPlan> {
            if let Some(prior) = ctx.prior {
                assert_eq!(ctx.sequence_number, 1);
                assert_eq!(prior.failed.sequence_number, 0);
                if prior.exists(&key) {
                    return Ok(TxnPlan::Satisfied);
                }
            }
            Ok(TxnPlan::Submit(vec![Operation::insert(key.clone(), Fields::new())]))
        };
        // A budget of one submission still lets the builder settle the race.
        let outcome = runner.run("test", builder).await.unwrap();
        assert_eq!(outcome, TxnOutcome::Satisfied { attempts: 1 });
        assert_eq!(store.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_builder_error_propagates() {
        let store = Arc::new(MemoryDocumentStore::new());
        let runner = TransactionRunner::new(store, fast_policy(3));
        let err = runner
            .run("test", |_: &AttemptContext<'_>| -> Result<TxnPlan> {
                Err(StateError::InvalidState("refused".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_empty_attempt_is_rejected() {
        let store = Arc::new(MemoryDocumentStore::new());
        let runner = TransactionRunner::new(store, fast_policy(3));
        let err = runner
            .run("test", |_: &AttemptContext<'_>| -> Result<TxnPlan> {
                Ok(TxnPlan::Submit(Vec::new()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidInput(_)));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 5,
            max_backoff_ms: 30,
            op_timeout: None,
        };
        assert_eq!(policy.backoff_ms(1), 5);
        assert_eq!(policy.backoff_ms(2), 10);
        assert_eq!(policy.backoff_ms(3), 20);
        assert_eq!(policy.backoff_ms(4), 30);
        assert_eq!(policy.backoff_ms(9), 30);
    }
}
