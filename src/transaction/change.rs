// ============================================================================
// Change Planning
// ============================================================================
//
// Turns a transaction attempt into the set of document images it would
// commit. Every precondition is checked against the pre-attempt state before
// any action is evaluated, and actions run against a private working copy,
// so a rejected attempt leaves nothing behind.
//
// ============================================================================

use super::{Action, Precondition, TransactionAttempt};
use crate::core::{DocKey, Document, Result, StateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Final image of one document after a committed attempt. `after == None` means deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub key: DocKey,
    pub after: Option<Document>,
}

/// Post-images of the documents a committed attempt touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReceipt {
    pub documents: Vec<Document>,
    pub deleted: Vec<DocKey>,
}

impl CommitReceipt {
    pub fn from_changes(changes: &[Change]) -> Self {
        let mut receipt = Self::default();
        for change in changes {
            match &change.after {
                Some(doc) => receipt.documents.push(doc.clone()),
                None => receipt.deleted.push(change.key.clone()),
            }
        }
        receipt
    }

    pub fn document(&self, key: &DocKey) -> Option<&Document> {
        self.documents.iter().find(|doc| &doc.key == key)
    }
}

/// Evaluates `attempt` against `current` and returns the changes to commit.
///
/// Fails with `Conflict` naming the first operation whose precondition (or
/// implied existence requirement) does not hold.
pub fn plan_changes<'a, F>(attempt: &TransactionAttempt, current: F) -> Result<Vec<Change>>
where
    F: Fn(&DocKey) -> Option<&'a Document>,
{
    for (index, op) in attempt.operations.iter().enumerate() {
        check_precondition(index, &op.precondition, current(&op.key))?;
    }

    let mut working: BTreeMap<DocKey, Option<Document>> = BTreeMap::new();
    for (index, op) in attempt.operations.iter().enumerate() {
        let existing = match working.get(&op.key) {
            Some(image) => image.clone(),
            None => current(&op.key).cloned(),
        };

        let next = match &op.action {
            Action::Check => continue,
            Action::Insert(fields) => {
                if existing.is_some() {
                    return Err(StateError::conflict(index, format!("{} already exists", op.key)));
                }
                Some(Document::new(op.key.clone(), fields.clone()))
            }
            Action::SetFields(fields) => {
                let mut doc = require(index, &op.key, existing)?;
                for (field, value) in fields {
                    doc.fields.insert(field.clone(), value.clone());
                }
                doc.revision += 1;
                Some(doc)
            }
            Action::Increment { field, delta } => {
                let mut doc = require(index, &op.key, existing)?;
                let current_value = match doc.fields.get(field) {
                    None | Some(Value::Null) => 0,
                    Some(value) => value.as_i64().ok_or_else(|| {
                        StateError::InvalidInput(format!(
                            "cannot increment non-integer field '{}' of {}",
                            field, op.key
                        ))
                    })?,
                };
                let updated = current_value.checked_add(*delta).ok_or_else(|| {
                    StateError::InvalidInput(format!("increment of '{}' on {} overflows", field, op.key))
                })?;
                doc.fields.insert(field.clone(), Value::from(updated));
                doc.revision += 1;
                Some(doc)
            }
            Action::Delete => {
                require(index, &op.key, existing)?;
                None
            }
        };
        working.insert(op.key.clone(), next);
    }

    Ok(working
        .into_iter()
        .map(|(key, after)| Change { key, after })
        .collect())
}

/// Writes planned changes into a keyed document map.
pub fn apply_changes(documents: &mut BTreeMap<DocKey, Document>, changes: &[Change]) {
    for change in changes {
        match &change.after {
            Some(doc) => {
                documents.insert(change.key.clone(), doc.clone());
            }
            None => {
                documents.remove(&change.key);
            }
        }
    }
}

fn check_precondition(index: usize, precondition: &Precondition, doc: Option<&Document>) -> Result<()> {
    match (precondition, doc) {
        (Precondition::Missing, None) | (Precondition::Exists, Some(_)) => Ok(()),
        (Precondition::Missing, Some(doc)) => {
            Err(StateError::conflict(index, format!("{} exists", doc.key)))
        }
        (Precondition::Exists, None) | (Precondition::FieldEquals { .. }, None) => {
            Err(StateError::conflict(index, "document missing"))
        }
        (Precondition::FieldEquals { field, value }, Some(doc)) => {
            if doc.fields.get(field) == Some(value) {
                Ok(())
            } else {
                Err(StateError::conflict(
                    index,
                    format!("{}: field '{}' does not equal {}", doc.key, field, value),
                ))
            }
        }
    }
}

fn require(index: usize, key: &DocKey, doc: Option<Document>) -> Result<Document> {
    doc.ok_or_else(|| StateError::conflict(index, format!("{} missing", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Fields;
    use crate::transaction::Operation;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn plan(attempt: &TransactionAttempt, store: &BTreeMap<DocKey, Document>) -> Result<Vec<Change>> {
        plan_changes(attempt, |key| store.get(key))
    }

    #[test]
    fn test_insert_then_increment_within_one_attempt() {
        let store = BTreeMap::new();
        let key = DocKey::new("c", "a");
        let attempt = TransactionAttempt::new(
            0,
            vec![
                Operation::insert(key.clone(), fields(json!({"n": 1}))),
                Operation::increment(key.clone(), "n", 2).when(Precondition::Missing),
            ],
        );
        let changes = plan(&attempt, &store).unwrap();
        assert_eq!(changes.len(), 1);
        let doc = changes[0].after.as_ref().unwrap();
        assert_eq!(doc.get("n"), Some(&json!(3)));
        assert_eq!(doc.revision, 2);
    }

    #[test]
    fn test_failed_precondition_rejects_whole_attempt() {
        let mut store = BTreeMap::new();
        let a = DocKey::new("c", "a");
        let b = DocKey::new("c", "b");
        store.insert(b.clone(), Document::new(b.clone(), fields(json!({"n": 0}))));

        let attempt = TransactionAttempt::new(
            0,
            vec![
                Operation::insert(a.clone(), Fields::new()),
                Operation::insert(b.clone(), Fields::new()),
            ],
        );
        let err = plan(&attempt, &store).unwrap_err();
        assert!(matches!(err, StateError::Conflict { op_index: 1, .. }));
    }

    #[test]
    fn test_field_equals_guard() {
        let mut store = BTreeMap::new();
        let key = DocKey::new("c", "a");
        store.insert(key.clone(), Document::new(key.clone(), fields(json!({"state": "open"}))));

        let guarded = |expected: &str| {
            TransactionAttempt::new(
                0,
                vec![Operation::set_fields(key.clone(), fields(json!({"state": "closed"}))).when(
                    Precondition::FieldEquals {
                        field: "state".into(),
                        value: json!(expected),
                    },
                )],
            )
        };

        assert!(plan(&guarded("closed"), &store).unwrap_err().is_conflict());
        let changes = plan(&guarded("open"), &store).unwrap();
        assert_eq!(changes[0].after.as_ref().unwrap().get("state"), Some(&json!("closed")));
    }

    #[test]
    fn test_increment_non_integer_is_invalid_input() {
        let mut store = BTreeMap::new();
        let key = DocKey::new("c", "a");
        store.insert(key.clone(), Document::new(key.clone(), fields(json!({"n": "x"}))));
        let attempt = TransactionAttempt::new(0, vec![Operation::increment(key, "n", 1)]);
        assert!(matches!(plan(&attempt, &store), Err(StateError::InvalidInput(_))));
    }

    #[test]
    fn test_delete_and_receipt() {
        let mut store = BTreeMap::new();
        let key = DocKey::new("c", "a");
        store.insert(key.clone(), Document::new(key.clone(), Fields::new()));
        let attempt = TransactionAttempt::new(0, vec![Operation::delete(key.clone())]);
        let changes = plan(&attempt, &store).unwrap();
        let receipt = CommitReceipt::from_changes(&changes);
        assert_eq!(receipt.deleted, vec![key.clone()]);
        apply_changes(&mut store, &changes);
        assert!(store.is_empty());
    }
}
