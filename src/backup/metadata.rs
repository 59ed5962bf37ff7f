use crate::core::{Result, StateError};
use crate::storage::blob::CHECKSUM_FORMAT;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a backup was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOrigin {
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub version: String,
}

impl BackupOrigin {
    pub fn new(environment: impl Into<String>, hostname: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            hostname: hostname.into(),
            version: version.into(),
        }
    }
}

/// Lifecycle position of a [`BackupMetadata`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetadataState {
    Draft,
    Started,
    Complete,
    Stored,
}

impl fmt::Display for MetadataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Draft => "draft",
            Self::Started => "started",
            Self::Complete => "complete",
            Self::Stored => "stored",
        };
        write!(f, "{label}")
    }
}

/// Provenance and lifecycle of one backup archive.
///
/// Moves forward only: draft, then started by [`begin`](Self::begin), then
/// complete once the archive is checksummed, then stored once the storage
/// layer has acknowledged it. Only stored metadata is ever listed.
///
/// Serialized form always carries `started_at` and `finished_at`; the
/// remaining optional fields are omitted while unset and default to unset
/// when absent on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub origin: BackupOrigin,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl BackupMetadata {
    pub fn new(origin: BackupOrigin) -> Self {
        Self {
            origin,
            ..Self::default()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn state(&self) -> MetadataState {
        if self.stored_at.is_some() {
            MetadataState::Stored
        } else if self.finished_at.is_some() {
            MetadataState::Complete
        } else if self.started_at.is_some() {
            MetadataState::Started
        } else {
            MetadataState::Draft
        }
    }

    pub fn is_stored(&self) -> bool {
        self.state() == MetadataState::Stored
    }

    pub fn begin(&mut self) -> Result<()> {
        self.begin_at(Utc::now())
    }

    /// Marks the start of capture. A started but unfinished record may be
    /// restarted; a finished one may not.
    pub fn begin_at(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.state() >= MetadataState::Complete {
            return Err(self.wrong_state("begin"));
        }
        self.started_at = Some(at);
        Ok(())
    }

    pub fn mark_complete(&mut self, size: u64, checksum: &str) -> Result<()> {
        self.mark_complete_at(size, checksum, Utc::now())
    }

    /// Records the finished archive's size and checksum.
    pub fn mark_complete_at(&mut self, size: u64, checksum: &str, at: DateTime<Utc>) -> Result<()> {
        if self.state() != MetadataState::Started {
            return Err(self.wrong_state("mark complete"));
        }
        if checksum.is_empty() {
            return Err(StateError::InvalidInput("backup checksum must not be empty".to_string()));
        }
        self.finished_at = Some(at);
        self.size = Some(size);
        self.checksum = Some(checksum.to_string());
        self.checksum_format = Some(CHECKSUM_FORMAT.to_string());
        Ok(())
    }

    /// Records the id and time assigned by the storage layer.
    pub fn bind_storage_location(&mut self, id: &str, stored_at: DateTime<Utc>) -> Result<()> {
        if self.state() != MetadataState::Complete {
            return Err(self.wrong_state("bind storage location"));
        }
        if id.is_empty() {
            return Err(StateError::InvalidInput("backup id must not be empty".to_string()));
        }
        self.id = Some(id.to_string());
        self.stored_at = Some(stored_at);
        Ok(())
    }

    pub fn as_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StateError::Fatal(format!("Failed to encode backup metadata: {}", e)))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StateError::CorruptRecord(format!("invalid backup metadata: {}", e)))
    }

    fn wrong_state(&self, action: &str) -> StateError {
        StateError::InvalidState(format!("cannot {} backup metadata in state '{}'", action, self.state()))
    }
}
