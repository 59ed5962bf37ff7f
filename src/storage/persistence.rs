//! Journal + snapshot persistence for the file-backed document store

use super::DocumentStore;
use crate::core::{DocKey, Document, Result, StateError};
use crate::transaction::{
    Change, CommitReceipt, TransactionAttempt, apply_changes, plan_changes,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{Level, event};

pub const JOURNAL_FILE: &str = "docstate.journal";
pub const SNAPSHOT_FILE: &str = "docstate.snapshot";
const SNAPSHOT_VERSION: u32 = 1;
const MAX_JOURNAL_ENTRY_LEN: usize = 64 * 1024 * 1024;

// ============================================================================
// Journal Entries
// ============================================================================

/// One committed attempt, as the set of document images it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub committed_at_ms: i64,
    pub changes: Vec<Change>,
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every commit.
    #[default]
    Sync,
    /// Flush to the OS after every commit, fsync only on checkpoint.
    Async,
}

// ============================================================================
// Journal
// ============================================================================

pub struct Journal {
    path: PathBuf,
    file: BufWriter<File>,
    durability: DurabilityMode,
    entries_since_checkpoint: usize,
    /// Set when a failed append could not be rolled back; cleared by `clear`.
    poisoned: bool,
}

/// Entries read back from a journal, plus whether the tail was torn by a crash.
pub struct JournalReplay {
    pub entries: Vec<JournalEntry>,
    pub torn_tail: bool,
}

impl Journal {
    pub fn open<P: AsRef<Path>>(path: P, durability: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StateError::Io(format!("Failed to create journal directory: {}", e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StateError::Io(format!("Failed to open journal: {}", e)))?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            durability,
            entries_since_checkpoint: 0,
            poisoned: false,
        })
    }

    /// Appends one framed entry. On failure the journal is cut back to its
    /// previous length so no partial frame is left in front of later entries.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        if self.poisoned {
            return Err(StateError::Fatal(
                "journal holds an unrecoverable partial write; checkpoint required".to_string(),
            ));
        }
        let serialized = rmp_serde::to_vec(entry)?;
        if serialized.len() > MAX_JOURNAL_ENTRY_LEN {
            return Err(StateError::Fatal(format!(
                "journal entry of {} bytes exceeds the {} byte limit",
                serialized.len(),
                MAX_JOURNAL_ENTRY_LEN
            )));
        }
        let len = serialized.len() as u32;
        let committed_len = self
            .file
            .get_ref()
            .metadata()
            .map_err(|e| StateError::Fatal(format!("Failed to stat journal: {}", e)))?
            .len();

        if let Err(err) = self.write_frame(&len.to_le_bytes(), &serialized) {
            if let Err(rollback) = self.truncate_to(committed_len) {
                event!(Level::ERROR, error = %rollback, "journal rollback failed");
                self.poisoned = true;
            }
            return Err(err);
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    fn write_frame(&mut self, header: &[u8], body: &[u8]) -> Result<()> {
        self.file
            .write_all(header)
            .and_then(|_| self.file.write_all(body))
            .and_then(|_| self.file.flush())
            .map_err(|e| StateError::Fatal(format!("Failed to write journal: {}", e)))?;
        if self.durability == DurabilityMode::Sync {
            self.file
                .get_mut()
                .sync_all()
                .map_err(|e| StateError::Fatal(format!("Failed to sync journal: {}", e)))?;
        }
        Ok(())
    }

    /// Drops any buffered bytes and cuts the file back to `len`.
    fn truncate_to(&mut self, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StateError::Io(format!("Failed to reopen journal: {}", e)))?;
        // `into_parts` hands back the unwritten buffer instead of flushing it.
        let (_, _unwritten) = std::mem::replace(&mut self.file, BufWriter::new(file)).into_parts();
        let file = self.file.get_ref();
        file.set_len(len)
            .and_then(|_| file.sync_all())
            .map_err(|e| StateError::Io(format!("Failed to truncate journal: {}", e)))
    }

    pub fn read_all(&self) -> Result<JournalReplay> {
        let mut replay = JournalReplay {
            entries: Vec::new(),
            torn_tail: false,
        };
        if !self.path.exists() {
            return Ok(replay);
        }
        let file = File::open(&self.path)
            .map_err(|e| StateError::Io(format!("Failed to open journal for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        loop {
            let mut len_bytes = [0u8; 4];
            match read_exact_or_eof(&mut reader, &mut len_bytes)? {
                ReadStatus::Complete => {}
                ReadStatus::Empty => break,
                ReadStatus::Partial => {
                    replay.torn_tail = true;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_JOURNAL_ENTRY_LEN {
                return Err(StateError::CorruptRecord(format!(
                    "journal frame length {} exceeds the {} byte limit",
                    len, MAX_JOURNAL_ENTRY_LEN
                )));
            }
            let mut data = vec![0u8; len];
            match read_exact_or_eof(&mut reader, &mut data)? {
                ReadStatus::Complete => {}
                ReadStatus::Empty | ReadStatus::Partial => {
                    replay.torn_tail = true;
                    break;
                }
            }
            let entry: JournalEntry = rmp_serde::from_slice(&data)?;
            replay.entries.push(entry);
        }
        Ok(replay)
    }

    pub fn clear(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| StateError::Io(format!("Failed to truncate journal: {}", e)))?;
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StateError::Io(format!("Failed to reopen journal: {}", e)))?;
        self.file = BufWriter::new(file);
        self.entries_since_checkpoint = 0;
        self.poisoned = false;
        Ok(())
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }
}

enum ReadStatus {
    Complete,
    Empty,
    Partial,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadStatus> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StateError::Io(format!("Failed to read journal: {}", e))),
        }
    }
    Ok(match filled {
        0 if !buf.is_empty() => ReadStatus::Empty,
        n if n == buf.len() => ReadStatus::Complete,
        _ => ReadStatus::Partial,
    })
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub created_at_ms: i64,
    pub last_sequence: u64,
    pub documents: Vec<Document>,
}

pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Writes to a temp file in the same directory, then renames over the old snapshot.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| StateError::InvalidInput("snapshot path has no parent".to_string()))?;
        fs::create_dir_all(dir)?;
        let serialized = rmp_serde::to_vec(snapshot)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| StateError::Io(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .and_then(|_| temp.flush())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| StateError::Io(format!("Failed to write snapshot: {}", e)))?;
        temp.persist(&self.path)
            .map_err(|e| StateError::Io(format!("Failed to rename snapshot: {}", e.error)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)
            .map_err(|e| StateError::Io(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StateError::CorruptRecord(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }
}

// ============================================================================
// File-backed Document Store
// ============================================================================

struct FileState {
    documents: BTreeMap<DocKey, Document>,
    journal: Journal,
    snapshot: SnapshotFile,
    next_sequence: u64,
    checkpoint_threshold: usize,
}

impl FileState {
    fn checkpoint(&mut self) -> Result<()> {
        let snapshot = StoreSnapshot {
            version: SNAPSHOT_VERSION,
            created_at_ms: Utc::now().timestamp_millis(),
            last_sequence: self.next_sequence.saturating_sub(1),
            documents: self.documents.values().cloned().collect(),
        };
        self.snapshot.save(&snapshot)?;
        self.journal.clear()?;
        event!(Level::DEBUG, documents = snapshot.documents.len(), "store checkpointed");
        Ok(())
    }
}

/// Document store that keeps its working set in memory and makes every
/// commit durable in an append-only journal before acknowledging it.
///
/// The directory is owned by one process at a time.
pub struct FileDocumentStore {
    state: RwLock<FileState>,
}

impl FileDocumentStore {
    /// Opens (or creates) a store in `data_dir`, replaying snapshot and journal.
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        durability: DurabilityMode,
        checkpoint_threshold: usize,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let journal = Journal::open(data_dir.join(JOURNAL_FILE), durability)?;
        let snapshot = SnapshotFile::new(data_dir.join(SNAPSHOT_FILE));

        let mut documents = BTreeMap::new();
        let mut next_sequence = 1;
        if let Some(loaded) = snapshot.load()? {
            next_sequence = loaded.last_sequence + 1;
            for doc in loaded.documents {
                documents.insert(doc.key.clone(), doc);
            }
        }

        let replay = journal.read_all()?;
        let replayed = replay.entries.len();
        for entry in replay.entries {
            if entry.sequence < next_sequence {
                continue;
            }
            apply_changes(&mut documents, &entry.changes);
            next_sequence = entry.sequence + 1;
        }

        let mut state = FileState {
            documents,
            journal,
            snapshot,
            next_sequence,
            checkpoint_threshold: checkpoint_threshold.max(1),
        };
        if replay.torn_tail {
            event!(Level::WARN, path = %data_dir.display(), "discarding torn journal tail");
            state.checkpoint()?;
        }
        event!(
            Level::INFO,
            path = %data_dir.display(),
            documents = state.documents.len(),
            replayed,
            "file document store opened"
        );

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Folds the journal into a fresh snapshot.
    pub async fn checkpoint(&self) -> Result<()> {
        self.state.write().await.checkpoint()
    }

    pub async fn journal_len(&self) -> usize {
        self.state.read().await.journal.entries_since_checkpoint()
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn fetch(&self, key: &DocKey) -> Result<Option<Document>> {
        Ok(self.state.read().await.documents.get(key).cloned())
    }

    async fn count(&self, key: &DocKey) -> Result<u64> {
        Ok(u64::from(self.state.read().await.documents.contains_key(key)))
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .values()
            .filter(|doc| doc.key.collection == collection)
            .cloned()
            .collect())
    }

    async fn submit(&self, attempt: &TransactionAttempt) -> Result<CommitReceipt> {
        let mut state = self.state.write().await;
        let changes = plan_changes(attempt, |key| state.documents.get(key))?;

        let entry = JournalEntry {
            sequence: state.next_sequence,
            committed_at_ms: Utc::now().timestamp_millis(),
            changes,
        };
        state.journal.append(&entry)?;
        state.next_sequence += 1;
        apply_changes(&mut state.documents, &entry.changes);

        // The commit is durable once journaled; a failed checkpoint only leaves
        // the journal longer and is retried on the next commit.
        if state.journal.entries_since_checkpoint() >= state.checkpoint_threshold {
            if let Err(err) = state.checkpoint() {
                event!(Level::WARN, error = %err, "checkpoint after commit failed; journal kept");
            }
        }
        Ok(CommitReceipt::from_changes(&entry.changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Fields;
    use crate::transaction::Operation;
    use serde_json::json;
    use tempfile::TempDir;

    fn insert(id: &str, n: i64) -> TransactionAttempt {
        let mut fields = Fields::new();
        fields.insert("n".into(), json!(n));
        TransactionAttempt::new(0, vec![Operation::insert(DocKey::new("c", id), fields)])
    }

    #[test]
    fn test_journal_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut journal = Journal::open(temp_dir.path().join("test.journal"), DurabilityMode::Sync).unwrap();
        for sequence in 1..=3 {
            journal
                .append(&JournalEntry {
                    sequence,
                    committed_at_ms: 0,
                    changes: Vec::new(),
                })
                .unwrap();
        }
        let replay = journal.read_all().unwrap();
        assert_eq!(replay.entries.len(), 3);
        assert!(!replay.torn_tail);
        assert_eq!(journal.entries_since_checkpoint(), 3);
    }

    #[tokio::test]
    async fn test_reopen_replays_journal() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 100).unwrap();
            store.submit(&insert("a", 1)).await.unwrap();
            store
                .submit(&TransactionAttempt::new(
                    0,
                    vec![Operation::increment(DocKey::new("c", "a"), "n", 4)],
                ))
                .await
                .unwrap();
        }
        let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 100).unwrap();
        let doc = store.fetch(&DocKey::new("c", "a")).await.unwrap().unwrap();
        assert_eq!(doc.get("n"), Some(&json!(5)));
        assert_eq!(doc.revision, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_threshold_folds_journal() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Async, 2).unwrap();
            store.submit(&insert("a", 1)).await.unwrap();
            assert_eq!(store.journal_len().await, 1);
            store.submit(&insert("b", 2)).await.unwrap();
            assert_eq!(store.journal_len().await, 0);
            store.submit(&insert("c", 3)).await.unwrap();
        }
        let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Async, 2).unwrap();
        assert_eq!(store.scan("c").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_torn_tail_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 100).unwrap();
            store.submit(&insert("a", 1)).await.unwrap();
        }
        let journal_path = temp_dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&journal_path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 100).unwrap();
        assert_eq!(store.count(&DocKey::new("c", "a")).await.unwrap(), 1);
        assert_eq!(store.journal_len().await, 0);
        store.submit(&insert("b", 2)).await.unwrap();
        drop(store);

        let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 100).unwrap();
        assert_eq!(store.scan("c").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_conflict_is_not_journaled() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 100).unwrap();
        store.submit(&insert("a", 1)).await.unwrap();
        assert!(store.submit(&insert("a", 2)).await.unwrap_err().is_conflict());
        assert_eq!(store.journal_len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_keeps_commit() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot_path = temp_dir.path().join(SNAPSHOT_FILE);
        {
            let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 1).unwrap();
            // A non-empty directory where the snapshot goes makes the rename fail.
            fs::create_dir_all(snapshot_path.join("blocker")).unwrap();

            let receipt = store.submit(&insert("a", 1)).await.unwrap();
            assert_eq!(receipt.documents.len(), 1);
            assert_eq!(store.count(&DocKey::new("c", "a")).await.unwrap(), 1);
            assert_eq!(store.journal_len().await, 1);
        }
        fs::remove_dir_all(&snapshot_path).unwrap();

        let store = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 1).unwrap();
        let doc = store.fetch(&DocKey::new("c", "a")).await.unwrap().unwrap();
        assert_eq!(doc.get("n"), Some(&json!(1)));
    }

    fn empty_entry(sequence: u64) -> JournalEntry {
        JournalEntry {
            sequence,
            committed_at_ms: 0,
            changes: Vec::new(),
        }
    }

    #[test]
    fn test_partial_write_is_cut_back() {
        let temp_dir = TempDir::new().unwrap();
        let mut journal = Journal::open(temp_dir.path().join("test.journal"), DurabilityMode::Sync).unwrap();
        journal.append(&empty_entry(1)).unwrap();
        let committed_len = fs::metadata(temp_dir.path().join("test.journal")).unwrap().len();

        // Half a frame: some bytes reached the file, some are still buffered.
        journal.file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        journal.file.flush().unwrap();
        journal.file.write_all(&[4, 5]).unwrap();
        journal.truncate_to(committed_len).unwrap();

        journal.append(&empty_entry(2)).unwrap();
        let replay = journal.read_all().unwrap();
        assert!(!replay.torn_tail);
        let sequences: Vec<u64> = replay.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_poisoned_journal_refuses_appends_until_cleared() {
        let temp_dir = TempDir::new().unwrap();
        let mut journal = Journal::open(temp_dir.path().join("test.journal"), DurabilityMode::Sync).unwrap();
        journal.poisoned = true;
        assert!(matches!(journal.append(&empty_entry(1)), Err(StateError::Fatal(_))));

        journal.clear().unwrap();
        journal.append(&empty_entry(1)).unwrap();
        assert_eq!(journal.read_all().unwrap().entries.len(), 1);
    }

    #[test]
    fn test_implausible_frame_length_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(JOURNAL_FILE), [0xff, 0xff, 0xff, 0xff, 0, 0]).unwrap();
        let err = FileDocumentStore::open(temp_dir.path(), DurabilityMode::Sync, 100).err().unwrap();
        assert!(matches!(err, StateError::CorruptRecord(_)));
    }
}
