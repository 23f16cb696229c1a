use crate::engine::EngineError;
use crate::service::{Gallery, NewEvent, ServiceError};
use eventlens_core::EventId;
use serde::Serialize;
use std::path::Path;
use zbus::interface;

/// D-Bus interface for the EventLens gallery daemon.
///
/// Bus name: org.eventlens.Gallery1
/// Object path: /org/eventlens/Gallery1
pub struct GalleryService {
    gallery: Gallery,
}

impl GalleryService {
    pub fn new(gallery: Gallery) -> Self {
        Self { gallery }
    }
}

#[interface(name = "org.eventlens.Gallery1")]
impl GalleryService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.gallery.status().map_err(to_fdo)?)
    }

    async fn list_events(&self) -> zbus::fdo::Result<String> {
        to_json(&self.gallery.list_events().map_err(to_fdo)?)
    }

    /// Photos of an event with their captions and face flags.
    async fn list_photos(&self, event_id: &str) -> zbus::fdo::Result<String> {
        to_json(&self.gallery.photos(&EventId::from(event_id)).map_err(to_fdo)?)
    }

    /// Create an event from a JSON object; returns the stored event.
    async fn create_event(&self, json: &str) -> zbus::fdo::Result<String> {
        let new: NewEvent = serde_json::from_str(json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid event JSON: {e}")))?;
        tracing::info!(name = %new.name, "create_event requested");
        to_json(&self.gallery.create_event(new).map_err(to_fdo)?)
    }

    /// Upload image files into an event. Files are read by the daemon; each
    /// gets its own receipt, and an unreadable file does not stop the rest.
    async fn upload(&self, event_id: &str, paths: Vec<String>) -> zbus::fdo::Result<String> {
        let event = EventId::from(event_id);
        tracing::info!(event = %event, files = paths.len(), "upload requested");

        let mut receipts = Vec::with_capacity(paths.len());
        for path in paths {
            let file_name = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            match tokio::fs::read(&path).await {
                Ok(bytes) => receipts.extend(self.gallery.upload_batch(&event, vec![(file_name, bytes)]).await),
                Err(e) => receipts.push(self.gallery.reject_upload(&event, &file_name, &format!("cannot read {path}: {e}"))),
            }
        }
        to_json(&receipts)
    }

    async fn upload_status(&self, upload_id: &str) -> zbus::fdo::Result<String> {
        let id = uuid::Uuid::parse_str(upload_id)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid upload id: {e}")))?;
        let status = self
            .gallery
            .upload_status(id)
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown upload {id}")))?;
        to_json(&status)
    }

    /// Find the photos of an event that show the person in the selfie.
    /// `k = 0` uses the configured default.
    async fn find_matches(&self, event_id: &str, selfie_path: &str, k: u32) -> zbus::fdo::Result<String> {
        let selfie = tokio::fs::read(selfie_path)
            .await
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("cannot read selfie {selfie_path}: {e}")))?;
        let k = (k > 0).then_some(k as usize);
        tracing::info!(event = event_id, ?k, "find_matches requested");
        let matches = self
            .gallery
            .find_matches(&EventId::from(event_id), selfie, k)
            .await
            .map_err(to_fdo)?;
        to_json(&matches)
    }

    async fn usage(&self) -> zbus::fdo::Result<String> {
        to_json(&self.gallery.usage().map_err(to_fdo)?)
    }

    /// Usage report with a short assessment of whether more storage is needed.
    async fn analyze_storage(&self) -> zbus::fdo::Result<String> {
        tracing::info!("analyze_storage requested");
        to_json(&self.gallery.analyze_storage().await.map_err(to_fdo)?)
    }

    /// Re-queue photos whose face detection never completed.
    async fn reindex_pending(&self, event_id: &str) -> zbus::fdo::Result<u32> {
        let queued = self
            .gallery
            .reindex_pending(&EventId::from(event_id))
            .map_err(to_fdo)?;
        Ok(queued as u32)
    }

    async fn reload_models(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reload_models requested");
        self.gallery.reload_models().await.map_err(to_fdo)?;
        to_json(&self.gallery.status().map_err(to_fdo)?)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn to_fdo(e: ServiceError) -> zbus::fdo::Error {
    use zbus::fdo::Error;
    let msg = e.to_string();
    match e {
        ServiceError::EventNotFound(_)
        | ServiceError::EventExists(_)
        | ServiceError::EventInactive(_)
        | ServiceError::InvalidEvent(_)
        | ServiceError::Unreadable(_)
        | ServiceError::Engine(EngineError::NoFaceFound)
        | ServiceError::Engine(EngineError::Pipeline(_)) => Error::InvalidArgs(msg),
        ServiceError::StorageExceeded { .. } => Error::LimitsExceeded(msg),
        ServiceError::Timeout(_) => Error::Timeout(msg),
        ServiceError::Store(_) | ServiceError::Media(_) => Error::IOError(msg),
        _ => Error::Failed(msg),
    }
}
