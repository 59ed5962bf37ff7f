// ============================================================================
// Backup pipeline: capture, dump, archive, store
// ============================================================================

pub mod archive;
pub mod metadata;
pub mod source;
pub mod storage;

pub use archive::{ArchiveReader, ArchiveSummary, ArchiveWriter, EntryHeader, METADATA_ENTRY};
pub use metadata::{BackupMetadata, BackupOrigin, MetadataState};
pub use source::{
    BackupPaths, CapturedFile, CommandDumper, DatabaseDumper, DirectoryEnumerator, FileEnumerator,
};
pub use storage::{ArchiveStorage, DocumentArchiveStorage, StoredLocation};

use crate::core::{Result, StateError};
use crate::storage::BlobReader;
use std::fmt;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{Instrument, Level, event, info_span};

/// Stage of one backup creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    Idle,
    Capturing,
    Dumping,
    Finalizing,
    Storing,
    Stored,
    Failed,
}

impl BackupStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stored | Self::Failed)
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Capturing),
            Self::Capturing => Some(Self::Dumping),
            Self::Dumping => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Storing),
            Self::Storing => Some(Self::Stored),
            Self::Stored | Self::Failed => None,
        }
    }
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Dumping => "dumping",
            Self::Finalizing => "finalizing",
            Self::Storing => "storing",
            Self::Stored => "stored",
            Self::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Enforces the forward-only stage order of one creation.
#[derive(Debug)]
pub struct StageTracker {
    stage: BackupStage,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            stage: BackupStage::Idle,
        }
    }

    pub fn stage(&self) -> BackupStage {
        self.stage
    }

    pub fn advance(&mut self, to: BackupStage) -> Result<()> {
        if self.stage.next() != Some(to) {
            return Err(StateError::InvalidState(format!(
                "backup cannot move from {} to {}",
                self.stage, to
            )));
        }
        event!(Level::DEBUG, from = %self.stage, to = %to, "backup stage");
        self.stage = to;
        Ok(())
    }

    /// Moves to `Failed` from any non-terminal stage. Returns the stage that failed.
    pub fn fail(&mut self) -> BackupStage {
        let failed_in = self.stage;
        if !self.stage.is_terminal() {
            self.stage = BackupStage::Failed;
        }
        failed_in
    }
}

/// Creates, lists, fetches and removes backups.
///
/// Capture and dump output are staged in temporary files that are dropped on
/// every exit path, so a failed creation leaves nothing behind except what the
/// storage layer already rolled back.
#[derive(Clone)]
pub struct Backups {
    storage: Arc<dyn ArchiveStorage>,
    enumerator: Arc<dyn FileEnumerator>,
    dumper: Option<Arc<dyn DatabaseDumper>>,
}

impl Backups {
    pub fn new(storage: Arc<dyn ArchiveStorage>) -> Self {
        Self {
            storage,
            enumerator: Arc::new(DirectoryEnumerator),
            dumper: None,
        }
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn FileEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn DatabaseDumper>) -> Self {
        self.dumper = Some(dumper);
        self
    }

    /// Creates and stores a new backup, updating `meta` in place.
    ///
    /// On success `meta` is stored and carries the assigned id. On failure it
    /// is left started, nothing listable was persisted, and it may be passed
    /// to `create` again.
    pub async fn create(&self, meta: &mut BackupMetadata, paths: &BackupPaths) -> Result<StoredLocation> {
        let mut tracker = StageTracker::new();
        let span = info_span!("backup.create", root = %paths.root.display());
        let result = self.run_create(meta, paths, &mut tracker).instrument(span).await;
        match &result {
            Ok(location) => {
                event!(Level::INFO, id = %location.id, "backup created");
            }
            Err(err) => {
                let stage = tracker.fail();
                event!(Level::ERROR, %stage, error = %err, "backup failed");
            }
        }
        result
    }

    async fn run_create(
        &self,
        meta: &mut BackupMetadata,
        paths: &BackupPaths,
        tracker: &mut StageTracker,
    ) -> Result<StoredLocation> {
        tracker.advance(BackupStage::Capturing)?;
        meta.begin()?;
        // Written into the archive before size and checksum exist.
        let provisional = meta.as_json_bytes()?;

        let enumerator = self.enumerator.clone();
        let capture_paths = paths.clone();
        let files = tokio::task::spawn_blocking(move || enumerator.enumerate(&capture_paths))
            .await?
            .map_err(|e| stage_error(e, StateError::Capture))?;
        event!(Level::INFO, files = files.len(), "files captured");

        tracker.advance(BackupStage::Dumping)?;
        let staging = tempfile::tempdir()?;
        let dumped = match &self.dumper {
            Some(dumper) => {
                let outputs = dumper
                    .dump(staging.path())
                    .await
                    .map_err(|e| stage_error(e, StateError::Dump))?;
                dump_entries(staging.path(), outputs)?
            }
            None => Vec::new(),
        };

        tracker.advance(BackupStage::Finalizing)?;
        let (archive, summary) =
            tokio::task::spawn_blocking(move || build_archive(&provisional, &files, &dumped)).await??;
        drop(staging);
        let started = meta.clone();
        meta.mark_complete(summary.size, &summary.checksum)?;
        event!(Level::INFO, size = summary.size, checksum = %summary.checksum, "archive finalized");

        tracker.advance(BackupStage::Storing)?;
        let mut reader = tokio::fs::File::from_std(archive.reopen()?);
        // A failed put hands the caller back a started record it can retry with.
        let location = match self.storage.put(meta, &mut reader).await {
            Ok(location) => location,
            Err(err) => {
                *meta = started;
                return Err(err);
            }
        };
        meta.bind_storage_location(&location.id, location.stored_at)?;

        tracker.advance(BackupStage::Stored)?;
        Ok(location)
    }

    /// Stored metadata plus a reader over the archive bytes.
    pub async fn get(&self, id: &str) -> Result<(BackupMetadata, BlobReader)> {
        self.storage.get(id).await
    }

    pub async fn metadata(&self, id: &str) -> Result<BackupMetadata> {
        self.storage.metadata(id).await
    }

    pub async fn list(&self) -> Result<Vec<BackupMetadata>> {
        self.storage.list().await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.storage.remove(id).await
    }
}

/// Keeps stage-specific errors as they are and folds anything else into the stage's kind.
fn stage_error(err: StateError, wrap: fn(String) -> StateError) -> StateError {
    match err {
        StateError::Capture(_) | StateError::Dump(_) | StateError::Timeout(_) => err,
        other => wrap(other.to_string()),
    }
}

/// Archive names for dump outputs, which must sit directly in the staging directory.
fn dump_entries(staging: &Path, outputs: Vec<PathBuf>) -> Result<Vec<(String, PathBuf)>> {
    outputs
        .into_iter()
        .map(|path| -> Result<(String, PathBuf)> {
            let name = path
                .strip_prefix(staging)
                .ok()
                .filter(|rel| rel.components().count() == 1)
                .and_then(|rel| rel.to_str())
                .ok_or_else(|| {
                    StateError::Dump(format!("dump output {} is outside the staging directory", path.display()))
                })?;
            Ok((format!("dump/{}", name), path.clone()))
        })
        .collect()
}

fn build_archive(
    provisional: &[u8],
    files: &[CapturedFile],
    dumped: &[(String, PathBuf)],
) -> Result<(NamedTempFile, ArchiveSummary)> {
    let mut archive = NamedTempFile::new()?;
    let summary = {
        let mut writer = ArchiveWriter::new(BufWriter::new(archive.as_file_mut()))?;
        writer.add_bytes(METADATA_ENTRY, provisional)?;
        for file in files {
            writer.add_file(&format!("root/{}", file.relative), &file.path)?;
        }
        for (name, path) in dumped {
            writer.add_file(name, path)?;
        }
        let (buffered, summary) = writer.finish()?;
        let file = buffered.into_inner().map_err(|e| StateError::from(e.into_error()))?;
        file.sync_all()?;
        summary
    };
    Ok((archive, summary))
}
