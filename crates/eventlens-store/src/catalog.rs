//! SQLite catalog of events, photos, and persisted embeddings.
//!
//! The catalog is the durable record; the in-memory embedding store is
//! rebuilt from [`Catalog::load_embeddings`] at startup.

use chrono::{DateTime, NaiveDate, Utc};
use eventlens_core::store::StoreError;
use eventlens_core::types::{Embedding, Event, EventId, Photo, PhotoId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    cover_image TEXT,
    date TEXT NOT NULL,
    location TEXT NOT NULL DEFAULT '',
    storage_used INTEGER NOT NULL DEFAULT 0,
    storage_limit INTEGER NOT NULL,
    access_code TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    search_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS photos (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL,
    url TEXT NOT NULL,
    thumbnail_url TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    has_faces INTEGER,               -- NULL until detection has run
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    digest TEXT NOT NULL,
    caption TEXT,
    FOREIGN KEY (event_id) REFERENCES events (id) ON DELETE CASCADE,
    UNIQUE (event_id, digest)
);

CREATE TABLE IF NOT EXISTS embeddings (
    photo_id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL,
    dim INTEGER NOT NULL,
    vector BLOB NOT NULL,            -- little-endian f32 components
    model_version TEXT,
    FOREIGN KEY (photo_id) REFERENCES photos (id) ON DELETE CASCADE,
    FOREIGN KEY (event_id) REFERENCES events (id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_photos_event ON photos (event_id, captured_at);
CREATE INDEX IF NOT EXISTS idx_photos_pending ON photos (event_id) WHERE has_faces IS NULL;
CREATE INDEX IF NOT EXISTS idx_embeddings_event ON embeddings (event_id);
"#;

const EVENT_COLUMNS: &str = "id, name, description, cover_image, date, location, \
     storage_used, storage_limit, access_code, active, search_count";

const PHOTO_COLUMNS: &str = "id, event_id, url, thumbnail_url, captured_at, has_faces, \
     width, height, size_bytes, digest, caption";

/// Per-event admin aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventUsage {
    pub event_id: EventId,
    pub name: String,
    pub photos: u64,
    pub photos_with_faces: u64,
    pub embeddings: u64,
    pub storage_used: u64,
    pub storage_limit: u64,
    pub search_count: u64,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open (or create) the catalog database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        tracing::info!(path = %path.display(), "opened catalog");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .and_then(|_| conn.execute_batch(SCHEMA))
            .map_err(unavailable)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("catalog lock poisoned".into()))?;
        f(&mut *conn).map_err(unavailable)
    }

    // --- events ---

    /// Insert `event` unless its id already exists. Returns whether it was inserted.
    pub fn insert_event(&self, event: &Event) -> Result<bool, StoreError> {
        self.with(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO events (id, name, description, cover_image, date, location, \
                 storage_used, storage_limit, access_code, active, search_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event.id.as_str(),
                    event.name,
                    event.description,
                    event.cover_image,
                    event.date,
                    event.location,
                    to_sql_u64(event.storage_used),
                    to_sql_u64(event.storage_limit),
                    event.access_code,
                    event.active,
                    to_sql_u64(event.search_count),
                ],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                [id.as_str()],
                event_from_row,
            )
            .optional()
        })
    }

    /// All events, most recent first.
    pub fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        self.with(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY date DESC, id"))?;
            let rows = stmt.query_map([], event_from_row)?;
            rows.collect()
        })
    }

    /// Atomically add `bytes` to the event's storage used if it stays within
    /// the limit. Returns false when the event is missing or would overflow.
    pub fn reserve_storage(&self, id: &EventId, bytes: u64) -> Result<bool, StoreError> {
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE events SET storage_used = storage_used + ?2 \
                 WHERE id = ?1 AND storage_used + ?2 <= storage_limit",
                params![id.as_str(), to_sql_u64(bytes)],
            )?;
            Ok(changed == 1)
        })
    }

    /// Undo a reservation for an upload that was not stored.
    pub fn release_storage(&self, id: &EventId, bytes: u64) -> Result<(), StoreError> {
        self.with(|conn| {
            conn.execute(
                "UPDATE events SET storage_used = MAX(storage_used - ?2, 0) WHERE id = ?1",
                params![id.as_str(), to_sql_u64(bytes)],
            )?;
            Ok(())
        })
    }

    pub fn increment_search_count(&self, id: &EventId) -> Result<(), StoreError> {
        self.with(|conn| {
            conn.execute("UPDATE events SET search_count = search_count + 1 WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    // --- photos ---

    /// Insert a photo. Returns false when the event already holds a photo
    /// with the same digest.
    pub fn insert_photo(&self, photo: &Photo) -> Result<bool, StoreError> {
        self.with(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO photos (id, event_id, url, thumbnail_url, captured_at, has_faces, \
                 width, height, size_bytes, digest, caption) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    photo.id.as_str(),
                    photo.event_id.as_str(),
                    photo.url,
                    photo.thumbnail_url,
                    photo.captured_at,
                    photo.has_faces,
                    photo.width,
                    photo.height,
                    to_sql_u64(photo.size_bytes),
                    photo.digest,
                    photo.caption,
                ],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn photo(&self, id: &PhotoId) -> Result<Option<Photo>, StoreError> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?1"),
                [id.as_str()],
                photo_from_row,
            )
            .optional()
        })
    }

    pub fn photo_by_digest(&self, event: &EventId, digest: &str) -> Result<Option<Photo>, StoreError> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE event_id = ?1 AND digest = ?2"),
                [event.as_str(), digest],
                photo_from_row,
            )
            .optional()
        })
    }

    /// Photos of an event in capture order.
    pub fn photos(&self, event: &EventId) -> Result<Vec<Photo>, StoreError> {
        self.select_photos(
            &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE event_id = ?1 ORDER BY captured_at, id"),
            event,
        )
    }

    /// Photos of an event whose face detection has not run yet.
    pub fn pending_photos(&self, event: &EventId) -> Result<Vec<Photo>, StoreError> {
        self.select_photos(
            &format!(
                "SELECT {PHOTO_COLUMNS} FROM photos \
                 WHERE event_id = ?1 AND has_faces IS NULL ORDER BY captured_at, id"
            ),
            event,
        )
    }

    fn select_photos(&self, sql: &str, event: &EventId) -> Result<Vec<Photo>, StoreError> {
        self.with(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([event.as_str()], photo_from_row)?;
            rows.collect()
        })
    }

    /// Record the detection outcome for a photo, with its embedding when a
    /// face was found. The face flag is set once: returns false and changes
    /// nothing when detection was already recorded.
    pub fn record_detection(&self, photo: &PhotoId, embedding: Option<&Embedding>) -> Result<bool, StoreError> {
        self.with(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE photos SET has_faces = ?2 WHERE id = ?1 AND has_faces IS NULL",
                params![photo.as_str(), embedding.is_some()],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            if let Some(embedding) = embedding {
                tx.execute(
                    "INSERT OR REPLACE INTO embeddings (photo_id, event_id, dim, vector, model_version) \
                     SELECT id, event_id, ?2, ?3, ?4 FROM photos WHERE id = ?1",
                    params![
                        photo.as_str(),
                        embedding.dimension() as i64,
                        encode_vector(&embedding.values),
                        embedding.model_version,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(true)
        })
    }

    /// Store the caption unless one is already set.
    pub fn set_caption(&self, photo: &PhotoId, caption: &str) -> Result<bool, StoreError> {
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE photos SET caption = ?2 WHERE id = ?1 AND caption IS NULL",
                params![photo.as_str(), caption],
            )?;
            Ok(changed == 1)
        })
    }

    // --- embeddings ---

    /// Every persisted embedding, for hydrating the in-memory store.
    pub fn load_embeddings(&self) -> Result<Vec<(EventId, PhotoId, Embedding)>, StoreError> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, photo_id, dim, vector, model_version FROM embeddings ORDER BY event_id, photo_id",
            )?;
            let rows = stmt.query_map([], |row| {
                let dim: i64 = row.get(2)?;
                let blob: Vec<u8> = row.get(3)?;
                let values = decode_vector(&blob);
                if values.len() as i64 != dim {
                    return Err(rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Blob,
                        format!("vector holds {} components, expected {dim}", values.len()).into(),
                    ));
                }
                Ok((
                    EventId::new(row.get::<_, String>(0)?),
                    PhotoId::new(row.get::<_, String>(1)?),
                    Embedding { values, model_version: row.get(4)? },
                ))
            })?;
            rows.collect()
        })
    }

    // --- admin ---

    pub fn usage(&self) -> Result<Vec<EventUsage>, StoreError> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.name, e.storage_used, e.storage_limit, e.search_count, \
                   (SELECT COUNT(*) FROM photos p WHERE p.event_id = e.id), \
                   (SELECT COUNT(*) FROM photos p WHERE p.event_id = e.id AND p.has_faces = 1), \
                   (SELECT COUNT(*) FROM embeddings m WHERE m.event_id = e.id) \
                 FROM events e ORDER BY e.date DESC, e.id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(EventUsage {
                    event_id: EventId::new(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    storage_used: from_sql_u64(row.get(2)?),
                    storage_limit: from_sql_u64(row.get(3)?),
                    search_count: from_sql_u64(row.get(4)?),
                    photos: from_sql_u64(row.get(5)?),
                    photos_with_faces: from_sql_u64(row.get(6)?),
                    embeddings: from_sql_u64(row.get(7)?),
                })
            })?;
            rows.collect()
        })
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn to_sql_u64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_u64(v: i64) -> u64 {
    v.max(0) as u64
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: EventId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        cover_image: row.get(3)?,
        date: row.get::<_, NaiveDate>(4)?,
        location: row.get(5)?,
        storage_used: from_sql_u64(row.get(6)?),
        storage_limit: from_sql_u64(row.get(7)?),
        access_code: row.get(8)?,
        active: row.get(9)?,
        search_count: from_sql_u64(row.get(10)?),
    })
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: PhotoId::new(row.get::<_, String>(0)?),
        event_id: EventId::new(row.get::<_, String>(1)?),
        url: row.get(2)?,
        thumbnail_url: row.get(3)?,
        captured_at: row.get::<_, DateTime<Utc>>(4)?,
        has_faces: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        size_bytes: from_sql_u64(row.get(8)?),
        digest: row.get(9)?,
        caption: row.get(10)?,
    })
}
