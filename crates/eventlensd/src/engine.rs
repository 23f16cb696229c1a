use eventlens_core::pipeline::{detect_face, detect_in_frame, extract_descriptor, PipelineError};
use eventlens_core::{
    find_matches, Embedding, EmbeddingStore, EuclideanMatcher, EventId, Frame, MatchError,
    MatchResult, ModelError, ModelLoader, PhotoId,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    ModelUnavailable(#[from] ModelError),
    #[error("no face found in the image")]
    NoFaceFound,
    #[error("pipeline error: {0}")]
    Pipeline(PipelineError),
    #[error("match error: {0}")]
    Match(#[from] MatchError),
    #[error("request cancelled by caller")]
    Cancelled,
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<PipelineError> for EngineError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NoFaceFound => EngineError::NoFaceFound,
            other => EngineError::Pipeline(other),
        }
    }
}

/// Result of indexing an uploaded photo.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    Face(Embedding),
    NoFace,
}

/// Messages sent from the gallery service to the engine workers.
enum EngineRequest {
    Index {
        event: EventId,
        photo: PhotoId,
        image: Arc<[u8]>,
        reply: oneshot::Sender<Result<IndexOutcome, EngineError>>,
    },
    Match {
        event: EventId,
        selfie: Vec<u8>,
        k: usize,
        reply: oneshot::Sender<Result<Vec<MatchResult>, EngineError>>,
    },
}

/// Clone-safe handle to the engine worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<[mpsc::Sender<EngineRequest>]>,
}

impl EngineHandle {
    /// Detect faces in an uploaded photo and describe the primary one.
    pub async fn index(
        &self,
        event: EventId,
        photo: PhotoId,
        image: Arc<[u8]>,
    ) -> Result<IndexOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(EngineRequest::Index { event, photo, image, reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Rank an event's photos against the face in `selfie`.
    ///
    /// Dropping the returned future abandons the request; the worker notices
    /// at its next stage boundary and skips the remaining work.
    pub async fn find_matches(
        &self,
        event: EventId,
        selfie: Vec<u8>,
        k: usize,
    ) -> Result<Vec<MatchResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(EngineRequest::Match { event, selfie, k, reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue on the least busy worker.
    async fn dispatch(&self, req: EngineRequest) -> Result<(), EngineError> {
        let tx = self
            .workers
            .iter()
            .max_by_key(|tx| tx.capacity())
            .ok_or(EngineError::ChannelClosed)?;
        tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

struct Worker {
    models: Arc<ModelLoader>,
    store: Arc<dyn EmbeddingStore>,
}

/// Spawn `workers` engine threads sharing one model loader and embedding store.
///
/// Models need not be loaded yet; requests that arrive before they are ready
/// fail with [`EngineError::ModelUnavailable`].
pub fn spawn_engine(
    models: Arc<ModelLoader>,
    store: Arc<dyn EmbeddingStore>,
    workers: usize,
    queue_depth: usize,
) -> Result<EngineHandle, EngineError> {
    let mut senders = Vec::with_capacity(workers.max(1));
    for n in 0..workers.max(1) {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
        let worker = Worker { models: Arc::clone(&models), store: Arc::clone(&store) };

        std::thread::Builder::new()
            .name(format!("eventlens-engine-{n}"))
            .spawn(move || {
                tracing::debug!(worker = n, "engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    worker.handle(req);
                }
                tracing::debug!(worker = n, "engine thread exiting");
            })?;
        senders.push(tx);
    }
    tracing::info!(workers = senders.len(), queue_depth, "engine started");

    Ok(EngineHandle { workers: senders.into() })
}

impl Worker {
    fn handle(&self, req: EngineRequest) {
        match req {
            EngineRequest::Index { event, photo, image, reply } => {
                let result = self.run_index(&image, &reply);
                match &result {
                    Ok(IndexOutcome::Face(_)) => tracing::debug!(event = %event, photo = %photo, "indexed face"),
                    Ok(IndexOutcome::NoFace) => tracing::debug!(event = %event, photo = %photo, "no face in photo"),
                    Err(e) => tracing::warn!(event = %event, photo = %photo, error = %e, "index failed"),
                }
                let _ = reply.send(result);
            }
            EngineRequest::Match { event, selfie, k, reply } => {
                let result = self.run_match(&event, &selfie, k, &reply);
                // The selfie and its descriptor die with this frame.
                drop(selfie);
                if let Err(EngineError::Cancelled) = result {
                    tracing::debug!(event = %event, "match abandoned by caller");
                    return;
                }
                let _ = reply.send(result);
            }
        }
    }

    fn run_index<T>(
        &self,
        image: &[u8],
        reply: &oneshot::Sender<Result<T, EngineError>>,
    ) -> Result<IndexOutcome, EngineError> {
        let models = self.models.ready()?;
        let gate = detect_face(&models, image);
        if !gate.present {
            return Ok(IndexOutcome::NoFace);
        }
        cancelled(reply)?;
        let frame = Frame::decode(image).map_err(PipelineError::from)?;
        match extract_descriptor(&models, &frame) {
            Ok(embedding) => Ok(IndexOutcome::Face(embedding)),
            Err(PipelineError::NoFaceFound) => Ok(IndexOutcome::NoFace),
            Err(e) => Err(e.into()),
        }
    }

    fn run_match<T>(
        &self,
        event: &EventId,
        selfie: &[u8],
        k: usize,
        reply: &oneshot::Sender<Result<T, EngineError>>,
    ) -> Result<Vec<MatchResult>, EngineError> {
        cancelled(reply)?;
        let models = self.models.ready()?;
        let frame = Frame::decode(selfie).map_err(PipelineError::from)?;
        let gate = detect_in_frame(&models, &frame);
        if !gate.present {
            return Err(EngineError::NoFaceFound);
        }

        cancelled(reply)?;
        let query = extract_descriptor(&models, &frame)?;

        cancelled(reply)?;
        let results = find_matches(self.store.as_ref(), &EuclideanMatcher, &query, event, k)?;
        tracing::debug!(
            event = %event,
            k,
            returned = results.len(),
            gate_ms = gate.elapsed.as_millis() as u64,
            "match complete"
        );
        Ok(results)
    }
}

fn cancelled<T>(reply: &oneshot::Sender<T>) -> Result<(), EngineError> {
    if reply.is_closed() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{png, stub_models, StubBackend};
    use eventlens_store::MemoryEmbeddingStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn engine(detect_delay: Duration) -> (EngineHandle, Arc<MemoryEmbeddingStore>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = ModelLoader::preloaded(stub_models(detect_delay, calls.clone()), StubBackend::new(true));
        let store = Arc::new(MemoryEmbeddingStore::new());
        let handle = spawn_engine(Arc::new(loader), store.clone(), 2, 4).unwrap();
        (handle, store, calls)
    }

    #[tokio::test]
    async fn test_index_bright_photo_yields_face() {
        let (engine, _, _) = engine(Duration::ZERO);
        let outcome = engine
            .index("wed".into(), "p1".into(), png(32, 32, 200).into())
            .await
            .unwrap();
        let IndexOutcome::Face(embedding) = outcome else {
            panic!("expected a face");
        };
        assert_eq!(embedding.dimension(), 2);
    }

    #[tokio::test]
    async fn test_index_dark_photo_yields_no_face() {
        let (engine, _, _) = engine(Duration::ZERO);
        let outcome = engine
            .index("wed".into(), "p1".into(), png(32, 32, 0).into())
            .await
            .unwrap();
        assert_eq!(outcome, IndexOutcome::NoFace);
    }

    #[tokio::test]
    async fn test_index_undecodable_bytes_fail_the_gate() {
        let (engine, _, calls) = engine(Duration::ZERO);
        let outcome = engine.index("wed".into(), "p1".into(), b"not an image".to_vec().into()).await.unwrap();
        assert_eq!(outcome, IndexOutcome::NoFace);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_match_ranks_event_gallery() {
        let (engine, store, _) = engine(Duration::ZERO);
        let event = EventId::from("wed");
        for (id, level) in [("p1", 100u8), ("p2", 200), ("p3", 250)] {
            let b = level as f32 / 255.0;
            store.put(&event, &id.into(), Embedding::new(vec![b, 1.0 - b])).unwrap();
        }
        store.put(&"other".into(), &"q1".into(), Embedding::new(vec![0.8, 0.2])).unwrap();

        let results = engine.find_matches(event, png(16, 16, 210), 2).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.photo_id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p3"]);
        assert!(results[0].distance <= results[1].distance);
    }

    #[tokio::test]
    async fn test_match_on_empty_event_is_empty() {
        let (engine, _, _) = engine(Duration::ZERO);
        let results = engine.find_matches("nobody".into(), png(16, 16, 210), 8).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_match_without_face() {
        let (engine, _, _) = engine(Duration::ZERO);
        let err = engine.find_matches("wed".into(), png(16, 16, 5), 8).await.unwrap_err();
        assert!(matches!(err, EngineError::NoFaceFound));
    }

    #[tokio::test]
    async fn test_match_unreadable_selfie() {
        let (engine, _, _) = engine(Duration::ZERO);
        let err = engine.find_matches("wed".into(), b"not an image".to_vec(), 8).await.unwrap_err();
        assert!(matches!(err, EngineError::Pipeline(PipelineError::Unreadable(_))));
    }

    #[tokio::test]
    async fn test_models_not_ready() {
        let loader = Arc::new(ModelLoader::new(StubBackend::new(false)));
        let engine = spawn_engine(loader, Arc::new(MemoryEmbeddingStore::new()), 1, 1).unwrap();
        let err = engine.find_matches("wed".into(), png(16, 16, 210), 8).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_dropped_caller_skips_extraction() {
        let (engine, _, calls) = engine(Duration::from_millis(200));
        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            engine.find_matches("wed".into(), png(16, 16, 210), 8),
        )
        .await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pipeline_no_face_maps_to_engine_no_face() {
        assert!(matches!(EngineError::from(PipelineError::NoFaceFound), EngineError::NoFaceFound));
    }
}
