//! Per-file upload lifecycle, tracked for status polling.

use chrono::{DateTime, Utc};
use eventlens_core::{EventId, PhotoId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Uploading,
    Processing,
    Completed {
        photo_id: PhotoId,
        has_faces: bool,
        caption: String,
    },
    Failed {
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid upload transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl UploadState {
    pub fn name(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Uploading => "uploading",
            UploadState::Processing => "processing",
            UploadState::Completed { .. } => "completed",
            UploadState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Completed { .. } | UploadState::Failed { .. })
    }

    /// Move to `next` if the lifecycle allows it.
    pub fn advance(&self, next: UploadState) -> Result<UploadState, InvalidTransition> {
        let allowed = match (self, &next) {
            (UploadState::Pending, UploadState::Uploading) => true,
            (UploadState::Uploading, UploadState::Processing) => true,
            (UploadState::Processing, UploadState::Completed { .. }) => true,
            (from, UploadState::Failed { .. }) => !from.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self.name(), to: next.name() })
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("unknown upload {0}")]
    Unknown(Uuid),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Latest known state of one upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub id: Uuid,
    pub event_id: EventId,
    pub file_name: String,
    #[serde(flatten)]
    pub state: UploadState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct UploadTracker {
    uploads: Mutex<HashMap<Uuid, UploadStatus>>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new upload in `Pending`.
    pub fn begin(&self, event_id: &EventId, file_name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let status = UploadStatus {
            id,
            event_id: event_id.clone(),
            file_name: file_name.to_string(),
            state: UploadState::Pending,
            updated_at: Utc::now(),
        };
        self.lock().insert(id, status);
        id
    }

    pub fn advance(&self, id: Uuid, next: UploadState) -> Result<(), TrackerError> {
        let mut uploads = self.lock();
        let status = uploads.get_mut(&id).ok_or(TrackerError::Unknown(id))?;
        status.state = status.state.advance(next)?;
        status.updated_at = Utc::now();
        Ok(())
    }

    /// Mark an upload failed, logging rather than propagating tracker errors.
    pub fn fail(&self, id: Uuid, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(upload = %id, reason = %reason, "upload failed");
        if let Err(e) = self.advance(id, UploadState::Failed { reason }) {
            tracing::warn!(upload = %id, error = %e, "could not record upload failure");
        }
    }

    pub fn get(&self, id: Uuid) -> Option<UploadStatus> {
        self.lock().get(&id).cloned()
    }

    /// Forget finished uploads last updated before `cutoff`.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut uploads = self.lock();
        let before = uploads.len();
        uploads.retain(|_, s| !(s.state.is_terminal() && s.updated_at < cutoff));
        before - uploads.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, UploadStatus>> {
        // Every mutation is a single assignment; a poisoned map is still consistent.
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
