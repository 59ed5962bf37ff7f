use crate::core::{Result, StateError};
use crate::storage::DurabilityMode;
use crate::transaction::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONTROL_COLLECTION: &str = "controlRecords";
pub const DEFAULT_BACKUP_COLLECTION: &str = "backups";
pub const DEFAULT_ERROR_THRESHOLD: u64 = 3;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Directory for the file-backed document store and blob directory
    pub data_dir: PathBuf,

    /// Durability of journal writes
    pub durability: DurabilityMode,

    /// Journal entries between automatic snapshots
    pub checkpoint_threshold: usize,

    /// Conflict retry and store call deadlines
    pub retry: RetryPolicy,

    /// Collection holding control records
    pub control_collection: String,

    /// Consecutive errors at which a control record stops reporting OK
    pub error_threshold: u64,

    /// Grace period given to newly created control records
    pub default_grace_period: Duration,

    /// Collection holding stored backup metadata
    pub backup_collection: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("docstate-data"),
            durability: DurabilityMode::Sync,
            checkpoint_threshold: 1000,
            retry: RetryPolicy::default(),
            control_collection: DEFAULT_CONTROL_COLLECTION.to_string(),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            default_grace_period: DEFAULT_GRACE_PERIOD,
            backup_collection: DEFAULT_BACKUP_COLLECTION.to_string(),
        }
    }
}

impl StateConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Build from `DOCSTATE_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(dir) = lookup("DOCSTATE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("DOCSTATE_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_number("DOCSTATE_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("DOCSTATE_GRACE_PERIOD_SECS") {
            config.default_grace_period =
                Duration::from_secs(parse_number("DOCSTATE_GRACE_PERIOD_SECS", &raw)?);
        }
        if let Some(raw) = lookup("DOCSTATE_DURABILITY") {
            config.durability = match raw.to_lowercase().as_str() {
                "sync" => DurabilityMode::Sync,
                "async" => DurabilityMode::Async,
                other => {
                    return Err(StateError::InvalidInput(format!(
                        "DOCSTATE_DURABILITY must be 'sync' or 'async', got '{}'",
                        other
                    )));
                }
            };
        }
        Ok(config)
    }

    /// Set the data directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set journal durability
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Set the snapshot interval
    pub fn checkpoint_threshold(mut self, entries: usize) -> Self {
        self.checkpoint_threshold = entries;
        self
    }

    /// Set the maximum number of submissions per transaction
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Set the deadline for each store call
    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.retry.op_timeout = Some(timeout);
        self
    }

    /// Replace the whole retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn error_threshold(mut self, threshold: u64) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn default_grace_period(mut self, period: Duration) -> Self {
        self.default_grace_period = period;
        self
    }

    pub fn control_collection(mut self, collection: &str) -> Self {
        self.control_collection = collection.to_string();
        self
    }

    pub fn backup_collection(mut self, collection: &str) -> Self {
        self.backup_collection = collection.to_string();
        self
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| StateError::InvalidInput(format!("{} must be a non-negative integer, got '{}'", name, raw)))
}
