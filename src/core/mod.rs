pub mod document;
pub mod error;

pub use document::{DocKey, Document, Fields, encode_fields};
pub use error::{ErrorClass, Result, StateError};
