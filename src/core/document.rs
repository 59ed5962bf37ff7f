use super::{Result, StateError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Field map of a stored document.
pub type Fields = serde_json::Map<String, Value>;

/// Address of one document: a collection plus an id unique within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A stored document.
///
/// `revision` starts at 1 on insert and is bumped by the store on every
/// committed mutation, so two reads with the same revision saw the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: DocKey,
    pub revision: u64,
    pub fields: Fields,
}

impl Document {
    pub fn new(key: DocKey, fields: Fields) -> Self {
        Self {
            key,
            revision: 1,
            fields,
        }
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Decodes the field map into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            StateError::CorruptRecord(format!("document '{}' has unexpected shape: {}", self.key, e))
        })
    }
}

/// Encodes a typed record into a field map. The record must serialize to an object.
pub fn encode_fields<T: Serialize>(record: &T) -> Result<Fields> {
    match serde_json::to_value(record) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(StateError::InvalidInput(format!(
            "document body must be an object, got {}",
            other
        ))),
        Err(e) => Err(StateError::InvalidInput(e.to_string())),
    }
}
