// ============================================================================
// Conditional Operations
// ============================================================================

use crate::core::{DocKey, Fields};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Condition a document must satisfy, evaluated against the state the store
/// holds when the attempt is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    Missing,
    Exists,
    FieldEquals { field: String, value: Value },
}

/// Mutation applied when every precondition of the attempt holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Insert(Fields),
    SetFields(Fields),
    /// Numeric add performed by the store; never a read-modify-write of a cached value.
    Increment { field: String, delta: i64 },
    Delete,
    /// Guard only, no mutation.
    Check,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub key: DocKey,
    pub precondition: Precondition,
    pub action: Action,
}

impl Operation {
    pub fn new(key: DocKey, precondition: Precondition, action: Action) -> Self {
        Self {
            key,
            precondition,
            action,
        }
    }

    /// Insert guarded by `Missing`.
    pub fn insert(key: DocKey, fields: Fields) -> Self {
        Self::new(key, Precondition::Missing, Action::Insert(fields))
    }

    /// Field update guarded by `Exists`.
    pub fn set_fields(key: DocKey, fields: Fields) -> Self {
        Self::new(key, Precondition::Exists, Action::SetFields(fields))
    }

    pub fn increment(key: DocKey, field: impl Into<String>, delta: i64) -> Self {
        Self::new(
            key,
            Precondition::Exists,
            Action::Increment {
                field: field.into(),
                delta,
            },
        )
    }

    pub fn delete(key: DocKey) -> Self {
        Self::new(key, Precondition::Exists, Action::Delete)
    }

    pub fn check(key: DocKey, precondition: Precondition) -> Self {
        Self::new(key, precondition, Action::Check)
    }

    /// Replaces the precondition, keeping the action.
    pub fn when(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }
}

/// One submission of a transaction: an ordered, all-or-nothing group of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionAttempt {
    pub sequence_number: usize,
    pub operations: Vec<Operation>,
}

impl TransactionAttempt {
    pub fn new(sequence_number: usize, operations: Vec<Operation>) -> Self {
        Self {
            sequence_number,
            operations,
        }
    }

    /// Distinct documents addressed by this attempt, in key order.
    pub fn touched_keys(&self) -> Vec<DocKey> {
        self.operations
            .iter()
            .map(|op| op.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
