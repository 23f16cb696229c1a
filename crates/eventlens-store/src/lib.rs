//! eventlens-store: storage for EventLens.
//!
//! [`MemoryEmbeddingStore`] serves match requests from memory; [`Catalog`]
//! persists events, photos, and embeddings in SQLite.

pub mod catalog;
pub mod embeddings;

pub use catalog::{Catalog, EventUsage};
pub use embeddings::MemoryEmbeddingStore;
