//! Events created at startup from a TOML file.
//!
//! ```toml
//! [[event]]
//! id = "wed-2024-june"
//! name = "Priya & Rahul Wedding"
//! date = "2024-06-15"
//! location = "Mumbai, India"
//! access_code = "1234"
//! ```

use crate::service::{Gallery, NewEvent, ServiceError};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("cannot read seed file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid seed file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default, rename = "event")]
    events: Vec<NewEvent>,
}

pub fn parse(text: &str) -> Result<Vec<NewEvent>, toml::de::Error> {
    Ok(toml::from_str::<SeedFile>(text)?.events)
}

/// Create every event in `path` whose id is not already in the catalog.
/// Returns how many were created.
pub fn apply(gallery: &Gallery, path: &Path) -> Result<usize, SeedError> {
    let shown = path.display().to_string();
    let text = std::fs::read_to_string(path)
        .map_err(|source| SeedError::Io { path: shown.clone(), source })?;
    let events = parse(&text).map_err(|source| SeedError::Parse { path: shown.clone(), source })?;

    let mut created = 0;
    for event in events {
        if gallery.seed_event(event)? {
            created += 1;
        }
    }
    tracing::info!(path = %shown, created, "seed events applied");
    Ok(created)
}
