//! The embedding store seam. Implementations live in `eventlens-store`.

use crate::types::{Embedding, EventId, PhotoId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backing storage cannot be reached or is corrupt. Fatal to both upload
    /// processing and matching; always surfaced to the caller.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid vector for photo {photo}: {reason}")]
    InvalidVector { photo: PhotoId, reason: String },
    #[error("event {event} holds {expected}-dim vectors, got {actual}")]
    DimensionMismatch { event: EventId, expected: usize, actual: usize },
}

/// One `(photo, vector)` pair as held by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub photo_id: PhotoId,
    pub embedding: Embedding,
}

/// Per-event collection of photo embeddings.
///
/// Must tolerate concurrent writers and readers. Writes for the same photo
/// are serialized with last-write-wins semantics.
pub trait EmbeddingStore: Send + Sync {
    /// Insert or overwrite the vector for `photo` under `event`.
    fn put(&self, event: &EventId, photo: &PhotoId, embedding: Embedding) -> Result<(), StoreError>;

    /// All vectors stored for `event`, ordered by photo id. Never includes
    /// vectors of other events.
    fn query(&self, event: &EventId) -> Result<Vec<StoredEmbedding>, StoreError>;

    /// Remove a photo's vector. Returns whether one was present.
    fn remove(&self, event: &EventId, photo: &PhotoId) -> Result<bool, StoreError>;

    /// Number of vectors stored for `event`.
    fn len(&self, event: &EventId) -> Result<usize, StoreError>;
}

/// Shared validation for [`EmbeddingStore::put`] implementations.
pub fn validate_vector(photo: &PhotoId, embedding: &Embedding) -> Result<(), StoreError> {
    if embedding.values.is_empty() {
        return Err(StoreError::InvalidVector { photo: photo.clone(), reason: "empty vector".into() });
    }
    if !embedding.is_finite() {
        return Err(StoreError::InvalidVector {
            photo: photo.clone(),
            reason: "non-finite component".into(),
        });
    }
    Ok(())
}
