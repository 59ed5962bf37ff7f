use super::metadata::BackupMetadata;
use crate::core::{DocKey, Document, Fields, Result, StateError, encode_fields};
use crate::storage::{BlobReader, BlobStore, DocumentStore, bounded};
use crate::transaction::{Operation, TransactionAttempt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{Level, event};
use uuid::Uuid;

const RECORD_KIND: &str = "backup";

/// Identity the storage layer assigned to an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLocation {
    pub id: String,
    pub stored_at: DateTime<Utc>,
}

/// Sink for finished archives.
///
/// A stored archive is visible through `get`/`list` only once both its bytes
/// and its metadata are durable; a failed `put` leaves neither behind.
#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    /// Stores a completed, not yet stored, metadata record with its archive.
    async fn put(
        &self,
        metadata: &BackupMetadata,
        archive: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredLocation>;

    async fn get(&self, id: &str) -> Result<(BackupMetadata, BlobReader)>;

    async fn metadata(&self, id: &str) -> Result<BackupMetadata>;

    /// Stored archives ordered by start time.
    async fn list(&self) -> Result<Vec<BackupMetadata>>;

    async fn remove(&self, id: &str) -> Result<()>;
}

/// Stored shape of a metadata document. `record` tags the document kind so
/// foreign documents in the collection are detected instead of misread.
#[derive(Debug, Serialize, Deserialize)]
struct StoredBackup {
    record: String,
    metadata: BackupMetadata,
}

fn decode_stored(doc: &Document) -> Result<BackupMetadata> {
    let stored: StoredBackup = doc.decode()?;
    if stored.record != RECORD_KIND {
        return Err(StateError::CorruptRecord(format!(
            "document {} is a '{}' record, not backup metadata",
            doc.key, stored.record
        )));
    }
    Ok(stored.metadata)
}

// ============================================================================
// Document + blob implementation
// ============================================================================

/// Metadata as documents in one collection, archive bytes in a blob store
/// keyed by their SHA-256. Identical archives share one blob.
pub struct DocumentArchiveStorage {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    collection: String,
    op_timeout: Option<Duration>,
}

impl DocumentArchiveStorage {
    pub fn new(documents: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>, collection: impl Into<String>) -> Self {
        Self {
            documents,
            blobs,
            collection: collection.into(),
            op_timeout: None,
        }
    }

    pub fn op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    fn key(&self, id: &str) -> DocKey {
        DocKey::new(self.collection.clone(), id)
    }

    async fn submit(&self, what: &str, operations: Vec<Operation>) -> Result<()> {
        let attempt = TransactionAttempt::new(0, operations);
        bounded(self.op_timeout, what, self.documents.submit(&attempt)).await?;
        Ok(())
    }

    async fn stored_metadata(&self, id: &str) -> Result<BackupMetadata> {
        let doc = bounded(self.op_timeout, "backup fetch", self.documents.fetch(&self.key(id)))
            .await?
            .ok_or_else(|| StateError::NotFound(format!("backup '{}'", id)))?;
        let metadata = decode_stored(&doc)?;
        if !metadata.is_stored() {
            return Err(StateError::NotFound(format!("backup '{}'", id)));
        }
        Ok(metadata)
    }

    async fn referenced(&self, checksum: &str) -> Result<bool> {
        let docs = bounded(self.op_timeout, "backup scan", self.documents.scan(&self.collection)).await?;
        Ok(docs
            .iter()
            .filter_map(|doc| decode_stored(doc).ok())
            .any(|meta| meta.checksum.as_deref() == Some(checksum)))
    }

    /// Deletes a blob no metadata refers to anymore.
    async fn release_blob(&self, checksum: &str) -> Result<()> {
        if !self.referenced(checksum).await?
            && bounded(self.op_timeout, "blob delete", self.blobs.delete(checksum)).await?
        {
            event!(Level::DEBUG, checksum, "unreferenced archive blob deleted");
        }
        Ok(())
    }

    async fn register(&self, id: &str, metadata: &BackupMetadata) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("record".to_string(), RECORD_KIND.into());
        fields.insert("metadata".to_string(), serde_json::Value::Object(encode_fields(metadata)?));
        self.submit("backup insert", vec![Operation::insert(self.key(id), fields)]).await
    }

    /// A concurrent remove of an identical archive may have released the blob
    /// between our upload and the insert.
    async fn verify_blob(&self, checksum: &str) -> Result<()> {
        if bounded(self.op_timeout, "blob check", self.blobs.contains(checksum)).await? {
            Ok(())
        } else {
            Err(StateError::conflict(0, format!("archive blob {} was released concurrently", checksum)))
        }
    }

    /// Undoes a failed `put`: drops the metadata document if it may exist,
    /// then the blob if nothing else references it.
    async fn discard(&self, id: Option<&str>, checksum: &str) {
        if let Some(id) = id {
            match self.submit("backup rollback", vec![Operation::delete(self.key(id))]).await {
                Ok(()) => {}
                // The insert never landed.
                Err(err) if err.is_conflict() => {}
                Err(err) => log::warn!("failed to roll back backup document {}: {}", id, err),
            }
        }
        if let Err(err) = self.release_blob(checksum).await {
            log::warn!("failed to release archive blob {} after error: {}", checksum, err);
        }
    }
}

#[async_trait]
impl ArchiveStorage for DocumentArchiveStorage {
    async fn put(
        &self,
        metadata: &BackupMetadata,
        archive: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredLocation> {
        let checksum = match (&metadata.checksum, metadata.finished_at, metadata.stored_at) {
            (Some(checksum), Some(_), None) => checksum.clone(),
            _ => {
                return Err(StateError::InvalidState(format!(
                    "only complete, unstored backup metadata can be stored (state '{}')",
                    metadata.state()
                )));
            }
        };

        let size = match bounded(self.op_timeout, "blob put", self.blobs.put(&checksum, archive)).await {
            Ok(size) => size,
            Err(err) => {
                self.discard(None, &checksum).await;
                return Err(err);
            }
        };
        if metadata.size.is_some_and(|declared| declared != size) {
            self.discard(None, &checksum).await;
            return Err(StateError::InvalidInput(format!(
                "archive is {} bytes but metadata declares {:?}",
                size, metadata.size
            )));
        }

        let location = StoredLocation {
            id: Uuid::new_v4().to_string(),
            stored_at: Utc::now(),
        };
        let mut stored = metadata.clone();
        if let Err(err) = stored.bind_storage_location(&location.id, location.stored_at) {
            self.discard(None, &checksum).await;
            return Err(err);
        }

        // A timed-out insert may still have committed, so the rollback always
        // tries the delete once the insert was attempted.
        let registered = match self.register(&location.id, &stored).await {
            Ok(()) => self.verify_blob(&checksum).await,
            Err(err) => Err(err),
        };
        if let Err(err) = registered {
            self.discard(Some(&location.id), &checksum).await;
            return Err(err);
        }
        event!(Level::INFO, id = %location.id, size, "backup archive stored");
        Ok(location)
    }

    async fn get(&self, id: &str) -> Result<(BackupMetadata, BlobReader)> {
        let metadata = self.stored_metadata(id).await?;
        let checksum = metadata
            .checksum
            .as_deref()
            .ok_or_else(|| StateError::CorruptRecord(format!("backup '{}' has no checksum", id)))?;
        let reader = bounded(self.op_timeout, "blob get", self.blobs.get(checksum)).await.map_err(|e| {
            if e.is_not_found() {
                StateError::CorruptRecord(format!("archive blob for backup '{}' is missing", id))
            } else {
                e
            }
        })?;
        Ok((metadata, reader))
    }

    async fn metadata(&self, id: &str) -> Result<BackupMetadata> {
        self.stored_metadata(id).await
    }

    async fn list(&self) -> Result<Vec<BackupMetadata>> {
        let docs = bounded(self.op_timeout, "backup scan", self.documents.scan(&self.collection)).await?;
        let mut listed = Vec::with_capacity(docs.len());
        for doc in &docs {
            let metadata = decode_stored(doc)?;
            if metadata.is_stored() {
                listed.push(metadata);
            }
        }
        listed.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(listed)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let metadata = self.stored_metadata(id).await?;
        self.submit("backup delete", vec![Operation::delete(self.key(id))])
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    StateError::NotFound(format!("backup '{}'", id))
                } else {
                    e
                }
            })?;
        if let Some(checksum) = metadata.checksum.as_deref() {
            self.release_blob(checksum).await?;
        }
        event!(Level::INFO, id, "backup removed");
        Ok(())
    }
}
