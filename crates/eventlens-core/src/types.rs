use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional, L2-normalized for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings. This is the only metric
    /// used for ranking; 0.0 means identical vectors.
    ///
    /// Callers are responsible for comparing equal-dimension vectors.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of an event (e.g., "wed-2024-june").
    EventId
);
string_id!(
    /// Identifier of a stored photo. Ordering is used as the ranking tie-break.
    PhotoId
);

/// An event that photographers upload into and attendees search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub description: String,
    pub cover_image: Option<String>,
    pub date: NaiveDate,
    pub location: String,
    /// Bytes consumed by uploaded originals and thumbnails.
    pub storage_used: u64,
    pub storage_limit: u64,
    /// Photographer access code. Stored and reported, never enforced.
    pub access_code: String,
    pub active: bool,
    pub search_count: u64,
}

impl Event {
    pub fn storage_remaining(&self) -> u64 {
        self.storage_limit.saturating_sub(self.storage_used)
    }
}

/// A photo stored under exactly one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    pub event_id: EventId,
    /// Reference to the full-size image, relative to the media root.
    pub url: String,
    pub thumbnail_url: String,
    pub captured_at: DateTime<Utc>,
    /// `None` until face detection has run; set exactly once.
    pub has_faces: Option<bool>,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    /// SHA-256 of the original bytes, hex encoded.
    pub digest: String,
    pub caption: Option<String>,
}

/// One ranked match: a photo and its distance to the query descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub photo_id: PhotoId,
    /// Euclidean distance, non-negative; 0.0 = identical.
    pub distance: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, -0.4, 0.5]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_3_4_5() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert!((b.euclidean_distance(&a) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_is_finite() {
        assert!(Embedding::new(vec![1.0, 2.0]).is_finite());
        assert!(!Embedding::new(vec![1.0, f32::NAN]).is_finite());
        assert!(!Embedding::new(vec![f32::INFINITY]).is_finite());
    }

    #[test]
    fn test_photo_id_ordering_is_lexicographic() {
        let mut ids = vec![PhotoId::from("p2"), PhotoId::from("p10"), PhotoId::from("p1")];
        ids.sort();
        assert_eq!(ids, vec![PhotoId::from("p1"), PhotoId::from("p10"), PhotoId::from("p2")]);
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = EventId::from("tech-summit-24");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tech-summit-24\"");
    }

    #[test]
    fn test_storage_remaining_saturates() {
        let event = Event {
            id: "e".into(),
            name: "E".into(),
            description: String::new(),
            cover_image: None,
            date: NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
            location: String::new(),
            storage_used: 6_000,
            storage_limit: 5_000,
            access_code: "1234".into(),
            active: true,
            search_count: 0,
        };
        assert_eq!(event.storage_remaining(), 0);
    }

    #[test]
    fn test_bounding_box_area_clamps_negative() {
        let b = BoundingBox {
            x: 0.0, y: 0.0, width: -5.0, height: 10.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.area(), 0.0);
    }
}
