use crate::core::{Document, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub(crate) const FIELD_LAST_SUCCESS: &str = "last_success_time";
pub(crate) const FIELD_CONSECUTIVE_ERRORS: &str = "consecutive_errors";
pub(crate) const FIELD_GRACE_PERIOD: &str = "grace_period_secs";

/// Persisted shape of a control record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ControlRecordDoc {
    #[serde(default)]
    pub last_success_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_errors: u64,
    pub grace_period_secs: u64,
}

impl ControlRecordDoc {
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            last_success_time: None,
            consecutive_errors: 0,
            grace_period_secs: grace_period.as_secs(),
        }
    }
}

/// Local copy of the status document for one scope.
///
/// Only valid as of `revision`; other processes may have moved the stored
/// record on since. Refresh through [`super::ControlRecords::refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    key: String,
    revision: u64,
    doc: ControlRecordDoc,
}

impl ControlRecord {
    pub(crate) fn from_document(key: &str, document: &Document) -> Result<Self> {
        Ok(Self {
            key: key.to_string(),
            revision: document.revision,
            doc: document.decode()?,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// `None` means no success has ever been recorded.
    pub fn last_success_time(&self) -> Option<DateTime<Utc>> {
        self.doc.last_success_time
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.doc.consecutive_errors
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.doc.grace_period_secs)
    }

    /// Whether `now` is at or past the end of the grace period.
    pub fn grace_period_exceeded(&self, now: DateTime<Utc>) -> bool {
        let Some(last_success) = self.doc.last_success_time else {
            return true;
        };
        let deadline = TimeDelta::from_std(self.grace_period())
            .ok()
            .and_then(|grace| last_success.checked_add_signed(grace));
        match deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Health summary derived from the error counter and the grace period.
    pub fn status_at(&self, now: DateTime<Utc>, error_threshold: u64) -> ControlStatus {
        if self.doc.consecutive_errors < error_threshold {
            return ControlStatus::new(StatusLevel::Ok, "ok");
        }
        if self.grace_period_exceeded(now) {
            return ControlStatus::new(StatusLevel::Critical, "exceeded grace period");
        }
        ControlStatus::new(StatusLevel::Degraded, "errors present, within grace period")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusLevel {
    Ok,
    Degraded,
    Critical,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "OK",
            Self::Degraded => "DEGRADED",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStatus {
    pub level: StatusLevel,
    pub message: String,
}

impl ControlStatus {
    fn new(level: StatusLevel, message: &str) -> Self {
        Self {
            level,
            message: message.to_string(),
        }
    }
}
