// ============================================================================
// Transaction Module
// ============================================================================
//
// Optimistic transactions over a conditional document store: an attempt is
// an ordered group of assert-then-act operations applied all-or-nothing, and
// the runner rebuilds and resubmits attempts that lose a race.
//
// ============================================================================

pub mod change;
pub mod op;
pub mod runner;

pub use change::{Change, CommitReceipt, apply_changes, plan_changes};
pub use op::{Action, Operation, Precondition, TransactionAttempt};
pub use runner::{
    AttemptContext, Observation, RetryPolicy, TransactionRunner, TxnBuilder, TxnOutcome, TxnPlan,
};
