use crate::backup::{Backups, DocumentArchiveStorage};
use crate::config::StateConfig;
use crate::control::ControlRecords;
use crate::core::Result;
use crate::storage::{BlobStore, DocumentStore, FileDocumentStore, FsBlobStore, MemoryBlobStore, MemoryDocumentStore};
use std::sync::Arc;
use tracing::{Level, event};

/// Entry point wiring a document store and a blob store into the control
/// record model and the backup orchestrator.
pub struct DocState {
    config: StateConfig,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    file_store: Option<Arc<FileDocumentStore>>,
}

impl DocState {
    /// Opens the file-backed stores under `config.data_dir`.
    pub async fn open(config: StateConfig) -> Result<Self> {
        let store_dir = config.store_dir();
        let durability = config.durability;
        let threshold = config.checkpoint_threshold;
        let file_store = tokio::task::spawn_blocking(move || {
            FileDocumentStore::open(store_dir, durability, threshold)
        })
        .await??;
        let file_store = Arc::new(file_store);
        let blobs = FsBlobStore::open(config.blob_dir()).await?;
        event!(Level::INFO, data_dir = %config.data_dir.display(), "state opened");

        Ok(Self {
            documents: file_store.clone(),
            blobs: Arc::new(blobs),
            file_store: Some(file_store),
            config,
        })
    }

    /// Volatile stores, mostly for tests.
    pub fn in_memory(config: StateConfig) -> Self {
        Self::with_stores(config, Arc::new(MemoryDocumentStore::new()), Arc::new(MemoryBlobStore::new()))
    }

    pub fn with_stores(config: StateConfig, documents: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            config,
            documents,
            blobs,
            file_store: None,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn control_records(&self) -> ControlRecords {
        ControlRecords::new(self.documents.clone(), &self.config)
    }

    /// Backup orchestrator over this state's stores, with no database dumper.
    pub fn backups(&self) -> Backups {
        let storage = DocumentArchiveStorage::new(
            self.documents.clone(),
            self.blobs.clone(),
            self.config.backup_collection.clone(),
        )
        .op_timeout(self.config.retry.op_timeout);
        Backups::new(Arc::new(storage))
    }

    /// Snapshots the file store and truncates its journal. No-op in memory.
    pub async fn checkpoint(&self) -> Result<()> {
        match &self.file_store {
            Some(store) => store.checkpoint().await,
            None => Ok(()),
        }
    }
}
