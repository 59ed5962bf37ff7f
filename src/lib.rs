// ============================================================================
// docstate Library
// ============================================================================

//! Small, frequently mutated documents kept consistent with conditional
//! writes and bounded conflict retry, plus a backup pipeline that tracks
//! content-addressed archives with the same store.
//!
//! ```no_run
//! use chrono::Utc;
//! use docstate::{DocState, StateConfig};
//!
//! # async fn run() -> docstate::Result<()> {
//! let state = DocState::open(StateConfig::new("/var/lib/docstate")).await?;
//! let records = state.control_records();
//!
//! let mut record = records.get_or_create("env-1").await?;
//! records.increment_errors(&mut record).await?;
//! println!("{}", records.status(&record, Utc::now()).level);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod control;
pub mod core;
pub mod facade;
pub mod storage;
pub mod transaction;

pub use config::StateConfig;
pub use control::{ControlRecord, ControlRecords, ControlStatus, StatusLevel};
pub use core::{DocKey, Document, ErrorClass, Fields, Result, StateError};
pub use facade::DocState;
pub use transaction::{RetryPolicy, TransactionRunner, TxnOutcome, TxnPlan};
