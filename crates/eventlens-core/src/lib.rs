//! eventlens-core: face matching for event photo galleries.
//!
//! SCRFD detects faces and ArcFace turns them into 512-dimensional
//! descriptors, both via ONNX Runtime on the CPU. Photos are matched to a
//! selfie by exact Euclidean k-nearest-neighbor ranking within one event.

pub mod alignment;
pub mod caption;
pub mod detector;
pub mod frame;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

pub use caption::{CaptionGenerator, CaptionProvider};
pub use detector::{FaceDetector, ScrfdDetector};
pub use frame::Frame;
pub use matcher::{find_matches, EuclideanMatcher, MatchError, Matcher};
pub use models::{default_model_dir, FaceModels, ModelBackend, ModelError, ModelLoader, ModelState, OnnxBackend};
pub use recognizer::{ArcFaceExtractor, EmbeddingExtractor};
pub use store::{EmbeddingStore, StoreError, StoredEmbedding};
pub use types::{BoundingBox, Embedding, Event, EventId, MatchResult, Photo, PhotoId};
