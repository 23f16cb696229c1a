use anyhow::{Context, Result};
use eventlens_core::{CaptionGenerator, ModelLoader, OnnxBackend};
use eventlens_store::{Catalog, MemoryEmbeddingStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod media;
mod seed;
mod service;
#[cfg(test)]
mod testing;
mod upload;

use config::{BusKind, Config};
use service::{Gallery, GalleryOptions};

const BUS_NAME: &str = "org.eventlens.Gallery1";
const OBJECT_PATH: &str = "/org/eventlens/Gallery1";

/// Finished upload records are kept this long for status polling.
const UPLOAD_RETENTION: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("eventlensd starting");
    let config = Config::from_env();

    let catalog = Arc::new(Catalog::open(&config.db_path).context("opening catalog")?);
    let store = Arc::new(MemoryEmbeddingStore::new());
    let hydrated = store
        .hydrate(catalog.load_embeddings().context("loading embeddings")?)
        .context("hydrating embedding store")?;
    tracing::info!(embeddings = hydrated, "embedding store hydrated");

    // Models load in the background; requests before they are ready fail
    // with a model-unavailable error instead of blocking startup.
    let models = Arc::new(ModelLoader::new(Arc::new(OnnxBackend::new(&config.model_dir))));
    tokio::spawn({
        let models = Arc::clone(&models);
        async move {
            if let Err(e) = models.load().await {
                tracing::warn!(error = %e, "face models not loaded; retry with ReloadModels");
            }
        }
    });

    let engine = engine::spawn_engine(
        Arc::clone(&models),
        store.clone(),
        config.engine_workers,
        config.queue_depth,
    )?;

    let gallery = Gallery::new(
        catalog,
        store,
        engine,
        models,
        media::MediaStore::new(&config.media_dir, config.thumbnail_size),
        CaptionGenerator::unconfigured(),
        GalleryOptions {
            default_matches: config.default_matches,
            match_timeout: Duration::from_secs(config.match_timeout_secs),
        },
    );

    if let Some(path) = &config.seed_file {
        seed::apply(&gallery, path).context("applying seed file")?;
    }

    tokio::spawn({
        let gallery = gallery.clone();
        async move {
            let mut tick = tokio::time::interval(UPLOAD_RETENTION / 4);
            loop {
                tick.tick().await;
                gallery.prune_uploads(UPLOAD_RETENTION);
            }
        }
    });

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::GalleryService::new(gallery))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, path = OBJECT_PATH, "eventlensd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("eventlensd shutting down");

    Ok(())
}
