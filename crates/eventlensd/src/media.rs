//! Uploaded originals and their thumbnails on disk.

use eventlens_core::{EventId, PhotoId};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path escapes the media root: {0}")]
    InvalidPath(String),
}

/// Files written for one photo. URLs are relative to the media root.
#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub url: String,
    pub thumbnail_url: String,
    /// Bytes written, original plus thumbnail.
    pub bytes_written: u64,
}

pub struct MediaStore {
    root: PathBuf,
    thumbnail_size: u32,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>, thumbnail_size: u32) -> Self {
        Self { root: root.into(), thumbnail_size }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Encode a JPEG thumbnail whose longest edge is at most the configured size.
    pub fn thumbnail(&self, img: &DynamicImage) -> Result<Vec<u8>, MediaError> {
        let rgb = if img.width().max(img.height()) > self.thumbnail_size {
            img.resize(self.thumbnail_size, self.thumbnail_size, FilterType::CatmullRom).to_rgb8()
        } else {
            img.to_rgb8()
        };
        let mut out = Cursor::new(Vec::new());
        rgb.write_to(&mut out, ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    }

    /// Write the original bytes unchanged plus a thumbnail under
    /// `<root>/<event>/`.
    pub fn save(
        &self,
        event: &EventId,
        photo: &PhotoId,
        original: &[u8],
        thumbnail: &[u8],
    ) -> Result<StoredMedia, MediaError> {
        let dir = self.resolve(event.as_str())?;
        std::fs::create_dir_all(&dir)?;

        let ext = image::guess_format(original)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("bin");
        let original_name = format!("{photo}.{ext}");
        let thumb_name = format!("{photo}.thumb.jpg");
        let original_path = dir.join(&original_name);

        std::fs::write(&original_path, original)?;
        if let Err(e) = std::fs::write(dir.join(&thumb_name), thumbnail) {
            if let Err(cleanup) = std::fs::remove_file(&original_path) {
                tracing::warn!(path = %original_path.display(), error = %cleanup, "failed to remove original");
            }
            return Err(e.into());
        }

        Ok(StoredMedia {
            url: format!("{event}/{original_name}"),
            thumbnail_url: format!("{event}/{thumb_name}"),
            bytes_written: (original.len() + thumbnail.len()) as u64,
        })
    }

    /// Best-effort removal of a photo's files, e.g. after a lost insert race.
    pub fn discard(&self, media: &StoredMedia) {
        for rel in [&media.url, &media.thumbnail_url] {
            let removed = self.resolve(rel).and_then(|path| Ok(std::fs::remove_file(path)?));
            if let Err(e) = removed {
                tracing::warn!(path = %rel, error = %e, "failed to remove media file");
            }
        }
    }

    pub fn read(&self, url: &str) -> Result<Vec<u8>, MediaError> {
        Ok(std::fs::read(self.resolve(url)?)?)
    }

    /// Join a root-relative path, refusing anything that could leave the root.
    fn resolve(&self, rel: &str) -> Result<PathBuf, MediaError> {
        let path = Path::new(rel);
        let mut components = path.components().peekable();
        if components.peek().is_none() || !components.all(|c| matches!(c, Component::Normal(_))) {
            return Err(MediaError::InvalidPath(rel.to_string()));
        }
        Ok(self.root.join(path))
    }
}
