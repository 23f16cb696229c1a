//! Load-once face model service.
//!
//! A [`ModelLoader`] is constructed explicitly, shared by `Arc`, and moves
//! through `NotLoaded → Loading → Ready | Failed`. Only one load runs at a
//! time; every caller that arrives while it runs resolves with its outcome.
//! A failed load is retried by the next `load()` call.

use crate::detector::{FaceDetector, ScrfdDetector};
use crate::recognizer::{ArcFaceExtractor, EmbeddingExtractor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("face models unavailable: {0}")]
    Unavailable(String),
}

/// Detector and extractor, initialized together and shared read-only.
pub struct FaceModels {
    pub detector: Box<dyn FaceDetector>,
    pub extractor: Box<dyn EmbeddingExtractor>,
}

/// Produces a fresh [`FaceModels`]. Called on a blocking thread.
pub trait ModelBackend: Send + Sync + 'static {
    fn load(&self) -> Result<FaceModels, ModelError>;

    /// Human-readable source, for logs and status output.
    fn describe(&self) -> String;
}

/// SCRFD + ArcFace ONNX models read from a directory.
pub struct OnnxBackend {
    model_dir: PathBuf,
}

impl OnnxBackend {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self { model_dir: model_dir.into() }
    }

    pub fn scrfd_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    pub fn arcface_path(&self) -> PathBuf {
        self.model_dir.join(ARCFACE_MODEL_FILE)
    }
}

impl ModelBackend for OnnxBackend {
    fn load(&self) -> Result<FaceModels, ModelError> {
        let detector = ScrfdDetector::load(&self.scrfd_path())
            .map_err(|e| ModelError::Unavailable(format!("SCRFD: {e}")))?;
        let extractor = ArcFaceExtractor::load(&self.arcface_path())
            .map_err(|e| ModelError::Unavailable(format!("ArcFace: {e}")))?;
        Ok(FaceModels {
            detector: Box::new(detector),
            extractor: Box::new(extractor),
        })
    }

    fn describe(&self) -> String {
        self.model_dir.display().to_string()
    }
}

/// Default model directory: `$XDG_DATA_HOME/eventlens/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("eventlens").join("models")
}

fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            Path::new(&home).join(".local/share")
        })
}

/// Observable lifecycle of a [`ModelLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    NotLoaded,
    Loading,
    Ready,
    Failed(String),
}

impl ModelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelState::Ready)
    }
}

enum Slot {
    NotLoaded,
    Loading,
    Ready(Arc<FaceModels>),
    Failed(String),
}

pub struct ModelLoader {
    backend: Arc<dyn ModelBackend>,
    slot: Arc<watch::Sender<Slot>>,
}

impl ModelLoader {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        let (tx, _) = watch::channel(Slot::NotLoaded);
        Self { backend, slot: Arc::new(tx) }
    }

    /// A loader that is already `Ready` with the given models.
    pub fn preloaded(models: FaceModels, backend: Arc<dyn ModelBackend>) -> Self {
        let (tx, _) = watch::channel(Slot::Ready(Arc::new(models)));
        Self { backend, slot: Arc::new(tx) }
    }

    pub fn backend(&self) -> &dyn ModelBackend {
        self.backend.as_ref()
    }

    /// Load the models unless they are already loaded or loading, then wait
    /// for the in-flight load to finish.
    pub async fn load(&self) -> Result<Arc<FaceModels>, ModelError> {
        self.acquire(false).await
    }

    /// Discard loaded models and load again. Joins an in-flight load instead
    /// of starting a second one.
    pub async fn reload(&self) -> Result<Arc<FaceModels>, ModelError> {
        self.acquire(true).await
    }

    /// Non-blocking accessor for use on the request path.
    pub fn ready(&self) -> Result<Arc<FaceModels>, ModelError> {
        match &*self.slot.borrow() {
            Slot::Ready(models) => Ok(Arc::clone(models)),
            Slot::NotLoaded => Err(ModelError::Unavailable("models not loaded".into())),
            Slot::Loading => Err(ModelError::Unavailable("models still loading".into())),
            Slot::Failed(reason) => Err(ModelError::Unavailable(reason.clone())),
        }
    }

    pub fn state(&self) -> ModelState {
        match &*self.slot.borrow() {
            Slot::NotLoaded => ModelState::NotLoaded,
            Slot::Loading => ModelState::Loading,
            Slot::Ready(_) => ModelState::Ready,
            Slot::Failed(reason) => ModelState::Failed(reason.clone()),
        }
    }

    async fn acquire(&self, force: bool) -> Result<Arc<FaceModels>, ModelError> {
        let mut rx = self.slot.subscribe();

        // The state check and the transition to Loading happen under the
        // channel's lock, so exactly one caller starts a given load.
        let start = self.slot.send_if_modified(|slot| match slot {
            Slot::Loading => false,
            Slot::Ready(_) if !force => false,
            _ => {
                *slot = Slot::Loading;
                true
            }
        });
        if start {
            self.spawn_load();
        }

        loop {
            match &*rx.borrow_and_update() {
                Slot::Ready(models) => return Ok(Arc::clone(models)),
                Slot::Failed(reason) => return Err(ModelError::Unavailable(reason.clone())),
                Slot::NotLoaded | Slot::Loading => {}
            }
            rx.changed()
                .await
                .map_err(|_| ModelError::Unavailable("model loader shut down".into()))?;
        }
    }

    /// Run the backend on a blocking thread, detached from the caller so a
    /// cancelled `load()` cannot strand the state in `Loading`.
    fn spawn_load(&self) {
        let backend = Arc::clone(&self.backend);
        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            let source = backend.describe();
            tracing::info!(source = %source, "loading face models");
            let started = std::time::Instant::now();

            let outcome = match tokio::task::spawn_blocking(move || backend.load()).await {
                Ok(Ok(models)) => {
                    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "face models ready");
                    Slot::Ready(Arc::new(models))
                }
                Ok(Err(ModelError::Unavailable(reason))) => {
                    tracing::error!(source = %source, reason = %reason, "face models unavailable");
                    Slot::Failed(reason)
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "model load task aborted");
                    Slot::Failed(format!("model load aborted: {join_err}"))
                }
            };
            slot.send_replace(outcome);
        });
    }
}
