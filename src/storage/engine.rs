use crate::core::{DocKey, Document, Result, StateError};
use crate::transaction::{CommitReceipt, TransactionAttempt};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Conditional document store - the only capability the transactional core
/// needs from a persistence backend.
///
/// `submit` evaluates every precondition of the attempt against the current
/// state atomically with respect to other submits, then applies every action
/// or none of them. A failed precondition is reported as
/// [`StateError::Conflict`]; anything else that goes wrong is a non-retryable
/// error. Committed changes are visible to the next `fetch`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document.
    async fn fetch(&self, key: &DocKey) -> Result<Option<Document>>;

    /// Number of documents stored under `key` (0 or 1).
    async fn count(&self, key: &DocKey) -> Result<u64>;

    /// All documents of a collection, ordered by id.
    async fn scan(&self, collection: &str) -> Result<Vec<Document>>;

    /// Apply an attempt all-or-nothing.
    async fn submit(&self, attempt: &TransactionAttempt) -> Result<CommitReceipt>;
}

/// Runs a store call under an optional deadline. Expiry becomes `Timeout`.
pub async fn bounded<T, F>(deadline: Option<Duration>, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            StateError::Timeout(format!("{} did not complete within {:?}", what, limit))
        })?,
        None => call.await,
    }
}
