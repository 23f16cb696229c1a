//! Gallery service: events, upload intake, background indexing, and selfie
//! matching over the catalog, media directory, and engine.

use crate::engine::{EngineError, EngineHandle, IndexOutcome};
use crate::media::{MediaError, MediaStore};
use crate::upload::{UploadState, UploadStatus, UploadTracker};
use chrono::{NaiveDate, Utc};
use eventlens_core::{
    CaptionGenerator, EmbeddingStore, Event, EventId, ModelError, ModelLoader, ModelState, Photo,
    PhotoId, StoreError,
};
use eventlens_store::{Catalog, EventUsage, MemoryEmbeddingStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Storage quota of events created without an explicit limit (5000 MiB).
pub const DEFAULT_STORAGE_LIMIT: u64 = 5000 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("event not found: {0}")]
    EventNotFound(EventId),
    #[error("event already exists: {0}")]
    EventExists(EventId),
    #[error("event {0} is not accepting uploads")]
    EventInactive(EventId),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("event {event} has {remaining} bytes left, upload needs {needed}")]
    StorageExceeded { event: EventId, needed: u64, remaining: u64 },
    #[error("unreadable image: {0}")]
    Unreadable(String),
    #[error("match request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// An upload that failed during intake. The failure is also recorded in the
/// upload tracker under `upload_id`.
#[derive(Error, Debug)]
#[error("upload of {file_name} failed: {source}")]
pub struct UploadRejected {
    pub upload_id: Uuid,
    pub file_name: String,
    #[source]
    pub source: ServiceError,
}

impl UploadRejected {
    pub fn into_receipt(self) -> UploadReceipt {
        UploadReceipt {
            upload_id: self.upload_id,
            file_name: self.file_name,
            photo_id: None,
            duplicate: false,
            error: Some(self.source.to_string()),
        }
    }
}

/// Request to create an event. Also the shape of seed file entries.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub id: Option<EventId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub location: String,
    /// Bytes; defaults to [`DEFAULT_STORAGE_LIMIT`].
    #[serde(default)]
    pub storage_limit: Option<u64>,
    /// Generated when absent.
    #[serde(default)]
    pub access_code: Option<String>,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub upload_id: Uuid,
    pub file_name: String,
    pub photo_id: Option<PhotoId>,
    /// The event already held identical bytes; `photo_id` is that photo.
    pub duplicate: bool,
    pub error: Option<String>,
}

/// One ranked match with its photo record.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoMatch {
    pub photo: Photo,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub events: usize,
    pub photos: u64,
    pub photos_with_faces: u64,
    pub indexed_embeddings: usize,
    pub storage_used: u64,
    pub storage_limit: u64,
    pub searches: u64,
    pub per_event: Vec<EventUsage>,
}

/// Usage figures with the provider's commentary on them.
#[derive(Debug, Clone, Serialize)]
pub struct StorageAnalysis {
    pub usage: UsageReport,
    pub analysis: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub models: String,
    pub models_ready: bool,
    pub model_source: String,
    pub workers: usize,
    pub indexed_events: usize,
    pub indexed_embeddings: usize,
    pub media_dir: String,
    pub captions_configured: bool,
}

/// Tunables the service takes from the daemon config.
#[derive(Debug, Clone, Copy)]
pub struct GalleryOptions {
    pub default_matches: usize,
    pub match_timeout: Duration,
}

struct Inner {
    catalog: Arc<Catalog>,
    store: Arc<MemoryEmbeddingStore>,
    engine: EngineHandle,
    models: Arc<ModelLoader>,
    media: MediaStore,
    captions: Arc<CaptionGenerator>,
    uploads: UploadTracker,
    options: GalleryOptions,
}

/// Clone-safe handle to the gallery service.
#[derive(Clone)]
pub struct Gallery {
    inner: Arc<Inner>,
}

impl Gallery {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<MemoryEmbeddingStore>,
        engine: EngineHandle,
        models: Arc<ModelLoader>,
        media: MediaStore,
        captions: CaptionGenerator,
        options: GalleryOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                store,
                engine,
                models,
                media,
                captions: Arc::new(captions),
                uploads: UploadTracker::new(),
                options,
            }),
        }
    }

    // --- events ---

    pub fn create_event(&self, new: NewEvent) -> Result<Event, ServiceError> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::InvalidEvent("name must not be empty".into()));
        }
        let storage_limit = new.storage_limit.unwrap_or(DEFAULT_STORAGE_LIMIT);
        if storage_limit == 0 {
            return Err(ServiceError::InvalidEvent("storage limit must be positive".into()));
        }

        let mut event = Event {
            id: EventId::from(""),
            name,
            description: new.description,
            cover_image: new.cover_image,
            date: new.date,
            location: new.location,
            storage_used: 0,
            storage_limit,
            access_code: new.access_code.unwrap_or_else(access_code),
            active: new.active,
            search_count: 0,
        };

        if let Some(id) = new.id {
            if !is_slug(id.as_str()) {
                return Err(ServiceError::InvalidEvent(format!(
                    "id {:?} must be lowercase letters, digits and dashes",
                    id.as_str()
                )));
            }
            event.id = id;
            if !self.inner.catalog.insert_event(&event)? {
                return Err(ServiceError::EventExists(event.id));
            }
        } else {
            let base = slug(&event.name);
            let mut n = 1;
            loop {
                event.id = if n == 1 { EventId::new(base.clone()) } else { EventId::new(format!("{base}-{n}")) };
                if self.inner.catalog.insert_event(&event)? {
                    break;
                }
                n += 1;
            }
        }

        tracing::info!(event = %event.id, name = %event.name, "event created");
        Ok(event)
    }

    /// Insert a seeded event unless its id already exists. Returns whether it
    /// was created.
    pub fn seed_event(&self, new: NewEvent) -> Result<bool, ServiceError> {
        let Some(id) = new.id.clone() else {
            return Err(ServiceError::InvalidEvent(format!("seed event {:?} has no id", new.name)));
        };
        match self.create_event(new) {
            Ok(_) => Ok(true),
            Err(ServiceError::EventExists(_)) => {
                tracing::debug!(event = %id, "seed event already present");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn list_events(&self) -> Result<Vec<Event>, ServiceError> {
        Ok(self.inner.catalog.list_events()?)
    }

    pub fn event(&self, id: &EventId) -> Result<Event, ServiceError> {
        self.inner
            .catalog
            .event(id)?
            .ok_or_else(|| ServiceError::EventNotFound(id.clone()))
    }

    /// Photos of one event in capture order.
    pub fn photos(&self, id: &EventId) -> Result<Vec<Photo>, ServiceError> {
        self.event(id)?;
        Ok(self.inner.catalog.photos(id)?)
    }

    // --- uploads ---

    /// Accept one file into an event. Face indexing and captioning continue in
    /// the background; poll [`Gallery::upload_status`] with the receipt's id.
    pub async fn upload(
        &self,
        event: &EventId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt, UploadRejected> {
        let upload_id = self.inner.uploads.begin(event, file_name);
        self.intake(upload_id, event, file_name, bytes).await.map_err(|source| {
            self.inner.uploads.fail(upload_id, source.to_string());
            UploadRejected { upload_id, file_name: file_name.to_string(), source }
        })
    }

    /// Upload several files independently; a failed file never stops the rest.
    pub async fn upload_batch(&self, event: &EventId, files: Vec<(String, Vec<u8>)>) -> Vec<UploadReceipt> {
        let mut receipts = Vec::with_capacity(files.len());
        for (file_name, bytes) in files {
            let receipt = match self.upload(event, &file_name, bytes).await {
                Ok(receipt) => receipt,
                Err(rejected) => rejected.into_receipt(),
            };
            receipts.push(receipt);
        }
        receipts
    }

    /// Record a file that could not even be read before intake, e.g. a
    /// missing path on the D-Bus side.
    pub fn reject_upload(&self, event: &EventId, file_name: &str, reason: &str) -> UploadReceipt {
        let upload_id = self.inner.uploads.begin(event, file_name);
        self.inner.uploads.fail(upload_id, reason);
        UploadReceipt {
            upload_id,
            file_name: file_name.to_string(),
            photo_id: None,
            duplicate: false,
            error: Some(reason.to_string()),
        }
    }

    pub fn upload_status(&self, upload_id: Uuid) -> Option<UploadStatus> {
        self.inner.uploads.get(upload_id)
    }

    /// Forget finished uploads older than `max_age`.
    pub fn prune_uploads(&self, max_age: Duration) {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return;
        };
        let removed = self.inner.uploads.prune(Utc::now() - age);
        if removed > 0 {
            tracing::debug!(removed, "pruned finished uploads");
        }
    }

    async fn intake(
        &self,
        upload_id: Uuid,
        event_id: &EventId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt, ServiceError> {
        let inner = &self.inner;
        advance(&inner.uploads, upload_id, UploadState::Uploading);

        let event = self.event_blocking(event_id).await?;
        if !event.active {
            return Err(ServiceError::EventInactive(event.id));
        }
        let size = bytes.len() as u64;
        let remaining = event.storage_remaining();
        if size > remaining {
            return Err(ServiceError::StorageExceeded { event: event.id, needed: size, remaining });
        }

        let digest = format!("{:x}", Sha256::digest(&bytes));
        if let Some(existing) = self.duplicate_of(event_id, &digest).await? {
            tracing::info!(event = %event_id, photo = %existing.id, file = file_name, "duplicate upload");
            return Ok(self.complete_duplicate(upload_id, file_name, existing));
        }

        let bytes: Arc<[u8]> = bytes.into();
        let this = self.clone();
        let decoded = Arc::clone(&bytes);
        let (width, height, thumbnail) = tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&decoded)
                .map_err(|e| ServiceError::Unreadable(e.to_string()))?;
            let thumbnail = this.inner.media.thumbnail(&img)?;
            Ok::<_, ServiceError>((img.width(), img.height(), thumbnail))
        })
        .await??;

        let needed = size + thumbnail.len() as u64;
        let reserved = {
            let id = event_id.clone();
            self.with_catalog(move |c| c.reserve_storage(&id, needed)).await?
        };
        if !reserved {
            let remaining = self.event_blocking(event_id).await?.storage_remaining();
            return Err(ServiceError::StorageExceeded { event: event_id.clone(), needed, remaining });
        }

        let photo_id = PhotoId::new(Uuid::new_v4().simple().to_string());
        let stored = match inner.media.save(event_id, &photo_id, &bytes, &thumbnail) {
            Ok(stored) => stored,
            Err(e) => {
                self.release(event_id, needed).await?;
                return Err(e.into());
            }
        };

        let photo = Photo {
            id: photo_id.clone(),
            event_id: event_id.clone(),
            url: stored.url.clone(),
            thumbnail_url: stored.thumbnail_url.clone(),
            captured_at: Utc::now(),
            has_faces: None,
            width,
            height,
            size_bytes: size,
            digest: digest.clone(),
            caption: None,
        };
        let inserted = {
            let photo = photo.clone();
            self.with_catalog(move |c| c.insert_photo(&photo)).await
        };
        match inserted {
            Ok(true) => {}
            outcome => {
                inner.media.discard(&stored);
                self.release(event_id, needed).await?;
                outcome?;
                // Identical bytes landed concurrently.
                if let Some(existing) = self.duplicate_of(event_id, &digest).await? {
                    return Ok(self.complete_duplicate(upload_id, file_name, existing));
                }
                return Err(StoreError::Unavailable(format!("photo {photo_id} was not stored")).into());
            }
        }

        tracing::info!(
            event = %event_id,
            photo = %photo_id,
            file = file_name,
            width,
            height,
            bytes = size,
            written = stored.bytes_written,
            "photo stored"
        );
        advance(&inner.uploads, upload_id, UploadState::Processing);

        let this = self.clone();
        tokio::spawn(async move {
            match this.index_photo(&photo, bytes).await {
                Ok((has_faces, caption)) => advance(
                    &this.inner.uploads,
                    upload_id,
                    UploadState::Completed { photo_id: photo.id, has_faces, caption },
                ),
                Err(e) => this.inner.uploads.fail(upload_id, e.to_string()),
            }
        });

        Ok(UploadReceipt {
            upload_id,
            file_name: file_name.to_string(),
            photo_id: Some(photo_id),
            duplicate: false,
            error: None,
        })
    }

    /// Run a catalog call on the blocking pool; the connection sits behind a
    /// mutex and SQLite does file I/O.
    async fn with_catalog<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&Catalog) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let catalog = Arc::clone(&self.inner.catalog);
        Ok(tokio::task::spawn_blocking(move || f(&catalog)).await??)
    }

    async fn event_blocking(&self, id: &EventId) -> Result<Event, ServiceError> {
        let lookup = id.clone();
        self.with_catalog(move |c| c.event(&lookup))
            .await?
            .ok_or_else(|| ServiceError::EventNotFound(id.clone()))
    }

    async fn duplicate_of(&self, event: &EventId, digest: &str) -> Result<Option<Photo>, ServiceError> {
        let (event, digest) = (event.clone(), digest.to_string());
        self.with_catalog(move |c| c.photo_by_digest(&event, &digest)).await
    }

    async fn release(&self, event: &EventId, bytes: u64) -> Result<(), ServiceError> {
        let event = event.clone();
        self.with_catalog(move |c| c.release_storage(&event, bytes)).await
    }

    fn complete_duplicate(&self, upload_id: Uuid, file_name: &str, existing: Photo) -> UploadReceipt {
        advance(&self.inner.uploads, upload_id, UploadState::Processing);
        advance(
            &self.inner.uploads,
            upload_id,
            UploadState::Completed {
                photo_id: existing.id.clone(),
                has_faces: existing.has_faces.unwrap_or(false),
                caption: existing.caption.clone().unwrap_or_default(),
            },
        );
        UploadReceipt {
            upload_id,
            file_name: file_name.to_string(),
            photo_id: Some(existing.id),
            duplicate: true,
            error: None,
        }
    }

    /// Detect, persist the outcome, then caption. Returns the face flag and
    /// the photo's caption.
    async fn index_photo(&self, photo: &Photo, bytes: Arc<[u8]>) -> Result<(bool, String), ServiceError> {
        let inner = &self.inner;
        let outcome = inner
            .engine
            .index(photo.event_id.clone(), photo.id.clone(), Arc::clone(&bytes))
            .await?;
        let embedding = match outcome {
            IndexOutcome::Face(embedding) => Some(embedding),
            IndexOutcome::NoFace => None,
        };
        let has_faces = embedding.is_some();

        // A failed put must leave the face flag unset so the photo stays pending.
        if let Some(embedding) = &embedding {
            inner.store.put(&photo.event_id, &photo.id, embedding.clone())?;
        }
        let recorded = {
            let (id, embedding) = (photo.id.clone(), embedding.clone());
            self.with_catalog(move |c| c.record_detection(&id, embedding.as_ref())).await
        };
        match recorded {
            Ok(true) => {}
            Ok(false) => tracing::debug!(photo = %photo.id, "detection already recorded"),
            Err(e) => {
                if embedding.is_some() {
                    if let Err(undo) = inner.store.remove(&photo.event_id, &photo.id) {
                        tracing::warn!(photo = %photo.id, error = %undo, "cannot roll back embedding");
                    }
                }
                return Err(e);
            }
        }

        let caption = match &photo.caption {
            Some(caption) => caption.clone(),
            None => {
                let captions = Arc::clone(&inner.captions);
                let caption = tokio::task::spawn_blocking(move || captions.generate(&bytes)).await?;
                let (id, text) = (photo.id.clone(), caption.clone());
                self.with_catalog(move |c| c.set_caption(&id, &text)).await?;
                caption
            }
        };

        tracing::debug!(photo = %photo.id, has_faces, "photo processed");
        Ok((has_faces, caption))
    }

    /// Re-run indexing for an event's photos that have no face flag yet,
    /// typically uploads made while models were unavailable. Returns the
    /// number of photos queued.
    pub fn reindex_pending(&self, event: &EventId) -> Result<usize, ServiceError> {
        self.event(event)?;
        let pending = self.inner.catalog.pending_photos(event)?;
        let queued = pending.len();
        for photo in pending {
            let this = self.clone();
            tokio::spawn(async move {
                let bytes = match this.inner.media.read(&photo.url) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(photo = %photo.id, error = %e, "cannot read photo for reindex");
                        return;
                    }
                };
                if let Err(e) = this.index_photo(&photo, bytes.into()).await {
                    tracing::warn!(photo = %photo.id, error = %e, "reindex failed");
                }
            });
        }
        tracing::info!(event = %event, queued, "reindex queued");
        Ok(queued)
    }

    // --- matching ---

    /// Photos of `event` closest to the face in `selfie`, nearest first.
    /// `k` defaults to the configured match count. Zero matches is a success.
    pub async fn find_matches(
        &self,
        event: &EventId,
        selfie: Vec<u8>,
        k: Option<usize>,
    ) -> Result<Vec<PhotoMatch>, ServiceError> {
        let inner = &self.inner;
        self.event_blocking(event).await?;
        {
            let event = event.clone();
            self.with_catalog(move |c| c.increment_search_count(&event)).await?;
        }

        let k = k.unwrap_or(inner.options.default_matches);
        let timeout = inner.options.match_timeout;
        let ranked = tokio::time::timeout(timeout, inner.engine.find_matches(event.clone(), selfie, k))
            .await
            .map_err(|_| ServiceError::Timeout(timeout))??;

        let matches = self
            .with_catalog(move |c| {
                let mut matches = Vec::with_capacity(ranked.len());
                for result in ranked {
                    match c.photo(&result.photo_id)? {
                        Some(photo) => matches.push(PhotoMatch { photo, distance: result.distance }),
                        None => tracing::warn!(photo = %result.photo_id, "matched photo missing from catalog"),
                    }
                }
                Ok(matches)
            })
            .await?;
        tracing::info!(event = %event, k, returned = matches.len(), "match request served");
        Ok(matches)
    }

    // --- admin ---

    pub fn usage(&self) -> Result<UsageReport, ServiceError> {
        let per_event = self.inner.catalog.usage()?;
        Ok(UsageReport {
            events: per_event.len(),
            photos: per_event.iter().map(|e| e.photos).sum(),
            photos_with_faces: per_event.iter().map(|e| e.photos_with_faces).sum(),
            indexed_embeddings: self.inner.store.total()?,
            storage_used: per_event.iter().map(|e| e.storage_used).sum(),
            storage_limit: per_event.iter().map(|e| e.storage_limit).sum(),
            searches: per_event.iter().map(|e| e.search_count).sum(),
            per_event,
        })
    }

    /// Usage report plus a short provider assessment of whether the events
    /// need more storage. Falls back to fixed text when no provider answers.
    pub async fn analyze_storage(&self) -> Result<StorageAnalysis, ServiceError> {
        let usage = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.usage()).await??
        };
        let summary = usage_summary(&usage);
        let captions = Arc::clone(&self.inner.captions);
        let analysis = tokio::task::spawn_blocking(move || captions.analyze_storage(&summary)).await?;
        tracing::info!(events = usage.events, storage_used = usage.storage_used, "storage analysis served");
        Ok(StorageAnalysis { usage, analysis })
    }

    pub fn status(&self) -> Result<StatusReport, ServiceError> {
        let inner = &self.inner;
        let state = inner.models.state();
        let models_ready = state.is_ready();
        let models = match state {
            ModelState::NotLoaded => "not loaded".to_string(),
            ModelState::Loading => "loading".to_string(),
            ModelState::Ready => "ready".to_string(),
            ModelState::Failed(reason) => format!("failed: {reason}"),
        };
        Ok(StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            models,
            models_ready,
            model_source: inner.models.backend().describe(),
            workers: inner.engine.worker_count(),
            indexed_events: inner.store.events()?.len(),
            indexed_embeddings: inner.store.total()?,
            media_dir: inner.media.root().display().to_string(),
            captions_configured: inner.captions.is_configured(),
        })
    }

    pub async fn reload_models(&self) -> Result<(), ServiceError> {
        self.inner.models.reload().await?;
        Ok(())
    }
}

/// Plain-text usage digest handed to the analysis provider.
fn usage_summary(usage: &UsageReport) -> String {
    let mut summary = format!(
        "{} events, {} photos, {} searches, {} of {} bytes used",
        usage.events, usage.photos, usage.searches, usage.storage_used, usage.storage_limit
    );
    for event in &usage.per_event {
        summary.push_str(&format!(
            "; {}: {} photos, {} of {} bytes",
            event.name, event.photos, event.storage_used, event.storage_limit
        ));
    }
    summary
}

fn advance(uploads: &UploadTracker, id: Uuid, next: UploadState) {
    if let Err(e) = uploads.advance(id, next) {
        tracing::warn!(upload = %id, error = %e, "upload state not updated");
    }
}

/// Four-digit photographer access code.
fn access_code() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10_000))
}

/// Event ids name directories under the media root, so only `[a-z0-9-]+`
/// is accepted.
fn is_slug(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Lowercase ASCII slug: "Priya & Rahul Wedding" -> "priya-rahul-wedding".
fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "event".to_string()
    } else {
        trimmed.to_string()
    }
}
