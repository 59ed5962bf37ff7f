pub mod blob;
pub mod engine;
pub mod memory;
pub mod persistence;

pub use blob::{BlobReader, BlobStore, FsBlobStore, MemoryBlobStore};
pub use engine::{DocumentStore, bounded};
pub use memory::MemoryDocumentStore;
pub use persistence::{DurabilityMode, FileDocumentStore};
