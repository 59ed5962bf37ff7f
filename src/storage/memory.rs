use super::DocumentStore;
use crate::core::{DocKey, Document, Result};
use crate::transaction::{CommitReceipt, TransactionAttempt, apply_changes, plan_changes};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Process-local document store. Submits are serialized by a write lock, so
/// precondition checks and writes of one attempt are never interleaved with
/// another attempt.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<BTreeMap<DocKey, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch(&self, key: &DocKey) -> Result<Option<Document>> {
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn count(&self, key: &DocKey) -> Result<u64> {
        Ok(u64::from(self.documents.read().await.contains_key(key)))
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|doc| doc.key.collection == collection)
            .cloned()
            .collect())
    }

    async fn submit(&self, attempt: &TransactionAttempt) -> Result<CommitReceipt> {
        let mut documents = self.documents.write().await;
        let changes = plan_changes(attempt, |key| documents.get(key))?;
        apply_changes(&mut documents, &changes);
        Ok(CommitReceipt::from_changes(&changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Fields, StateError};
    use crate::transaction::Operation;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_fetch_and_count() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::new("c", "a");
        assert_eq!(store.count(&key).await.unwrap(), 0);

        let receipt = store
            .submit(&TransactionAttempt::new(0, vec![Operation::insert(key.clone(), fields(json!({"n": 1})))]))
            .await
            .unwrap();
        assert_eq!(receipt.document(&key).unwrap().revision, 1);
        assert_eq!(store.count(&key).await.unwrap(), 1);
        assert_eq!(store.fetch(&key).await.unwrap().unwrap().get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_rejected_attempt_leaves_no_trace() {
        let store = MemoryDocumentStore::new();
        let a = DocKey::new("c", "a");
        let b = DocKey::new("c", "b");
        let attempt = TransactionAttempt::new(
            0,
            vec![
                Operation::insert(a.clone(), Fields::new()),
                Operation::increment(b.clone(), "n", 1),
            ],
        );
        let err = store.submit(&attempt).await.unwrap_err();
        assert!(matches!(err, StateError::Conflict { op_index: 1, .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_scan_filters_by_collection() {
        let store = MemoryDocumentStore::new();
        store
            .submit(&TransactionAttempt::new(
                0,
                vec![
                    Operation::insert(DocKey::new("x", "2"), Fields::new()),
                    Operation::insert(DocKey::new("x", "1"), Fields::new()),
                    Operation::insert(DocKey::new("y", "1"), Fields::new()),
                ],
            ))
            .await
            .unwrap();
        let ids: Vec<String> = store
            .scan("x")
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.key.id)
            .collect();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }
}
