//! Detection gate and descriptor extraction over a loaded [`FaceModels`].

use crate::detector::DetectorError;
use crate::frame::{Frame, FrameError};
use crate::models::FaceModels;
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, Embedding};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unreadable image: {0}")]
    Unreadable(#[from] FrameError),
    #[error("no face found")]
    NoFaceFound,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extractor returned a {actual}-dim vector, expected {expected}")]
    BadDescriptor { expected: usize, actual: usize },
}

/// Outcome of the face-presence gate.
#[derive(Debug, Clone)]
pub struct Detection {
    pub present: bool,
    pub faces: Vec<BoundingBox>,
    /// Wall time spent decoding and detecting.
    pub elapsed: Duration,
}

/// Decide whether an encoded image contains at least one face.
///
/// Never fails: undecodable input and detector errors both report
/// `present = false`.
pub fn detect_face(models: &FaceModels, image: &[u8]) -> Detection {
    let started = Instant::now();
    match Frame::decode(image) {
        Ok(frame) => {
            let mut detection = detect_in_frame(models, &frame);
            detection.elapsed = started.elapsed();
            detection
        }
        Err(e) => {
            tracing::warn!(error = %e, bytes = image.len(), "face gate: unreadable image");
            Detection { present: false, faces: Vec::new(), elapsed: started.elapsed() }
        }
    }
}

/// Face-presence gate over an already decoded frame.
pub fn detect_in_frame(models: &FaceModels, frame: &Frame) -> Detection {
    let started = Instant::now();
    let faces = models.detector.detect(frame).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "face gate: detector failed");
        Vec::new()
    });
    let detection = Detection {
        present: !faces.is_empty(),
        faces,
        elapsed: started.elapsed(),
    };
    tracing::debug!(
        faces = detection.faces.len(),
        elapsed_ms = detection.elapsed.as_millis() as u64,
        "face gate"
    );
    detection
}

/// Pick the face to describe when several are present: highest confidence,
/// then largest box, then leftmost, then topmost.
pub fn primary_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().min_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.area().total_cmp(&a.area()))
            .then_with(|| a.x.total_cmp(&b.x))
            .then_with(|| a.y.total_cmp(&b.y))
    })
}

/// Compute the descriptor of the primary face.
///
/// Detection is re-run here rather than trusting an earlier gate result, so a
/// frame that no longer yields a face fails with [`PipelineError::NoFaceFound`].
pub fn extract_descriptor(models: &FaceModels, frame: &Frame) -> Result<Embedding, PipelineError> {
    let faces = models.detector.detect(frame)?;
    let face = primary_face(&faces).ok_or(PipelineError::NoFaceFound)?;

    let embedding = models.extractor.extract(frame, face)?;
    let expected = models.extractor.dimension();
    if embedding.dimension() != expected || !embedding.is_finite() {
        return Err(PipelineError::BadDescriptor { expected, actual: embedding.dimension() });
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FaceDetector;
    use crate::recognizer::EmbeddingExtractor;
    use image::{ImageFormat, Luma};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn face(x: f32, w: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x, y: 0.0, width: w, height: w, confidence,
            landmarks: Some([(1.0, 1.0), (3.0, 1.0), (2.0, 2.0), (1.0, 3.0), (3.0, 3.0)]),
        }
    }

    /// Bright frames contain a face.
    struct Bright;
    impl FaceDetector for Bright {
        fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(if frame.avg_brightness() > 100.0 { vec![face(0.0, 4.0, 0.9)] } else { vec![] })
        }
    }

    /// Sees a face on the first call only.
    struct Flaky(AtomicUsize);
    impl FaceDetector for Flaky {
        fn detect(&self, _: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(if n == 0 { vec![face(0.0, 4.0, 0.9)] } else { vec![] })
        }
    }

    struct Broken;
    impl FaceDetector for Broken {
        fn detect(&self, _: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    struct Brightness { dim: usize }
    impl EmbeddingExtractor for Brightness {
        fn extract(&self, frame: &Frame, _: &BoundingBox) -> Result<Embedding, RecognizerError> {
            Ok(Embedding::new(vec![frame.avg_brightness() / 255.0; self.dim]))
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    fn models(detector: impl FaceDetector + 'static, dim: usize) -> FaceModels {
        FaceModels { detector: Box::new(detector), extractor: Box::new(Brightness { dim }) }
    }

    fn png(level: u8) -> Vec<u8> {
        let img = image::GrayImage::from_pixel(8, 8, Luma([level]));
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::from(img).write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_detect_face_present() {
        let d = detect_face(&models(Bright, 2), &png(200));
        assert!(d.present);
        assert_eq!(d.faces.len(), 1);
    }

    #[test]
    fn test_detect_face_absent() {
        assert!(!detect_face(&models(Bright, 2), &png(10)).present);
    }

    #[test]
    fn test_detect_face_malformed_input_is_false() {
        let m = models(Bright, 2);
        assert!(!detect_face(&m, b"\x89PNG garbage").present);
        assert!(!detect_face(&m, &[]).present);
    }

    #[test]
    fn test_detect_face_detector_error_is_false() {
        assert!(!detect_face(&models(Broken, 2), &png(200)).present);
    }

    #[test]
    fn test_extract_revalidates_presence() {
        let m = models(Flaky(AtomicUsize::new(0)), 2);
        let frame = Frame::decode(&png(200)).unwrap();
        assert!(detect_in_frame(&m, &frame).present);
        assert!(matches!(extract_descriptor(&m, &frame), Err(PipelineError::NoFaceFound)));
    }

    #[test]
    fn test_extract_descriptor_dimension_checked() {
        let frame = Frame::decode(&png(200)).unwrap();
        assert!(extract_descriptor(&models(Bright, 2), &frame).is_ok());
        assert!(matches!(
            extract_descriptor(&models(Bright, 3), &frame),
            Err(PipelineError::BadDescriptor { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_primary_face_prefers_confidence() {
        let faces = vec![face(0.0, 10.0, 0.7), face(50.0, 5.0, 0.95)];
        assert_eq!(primary_face(&faces).unwrap().x, 50.0);
    }

    #[test]
    fn test_primary_face_ties_by_area_then_left() {
        let faces = vec![face(30.0, 10.0, 0.9), face(20.0, 20.0, 0.9), face(10.0, 20.0, 0.9)];
        assert_eq!(primary_face(&faces).unwrap().x, 10.0);
    }

    #[test]
    fn test_primary_face_empty() {
        assert!(primary_face(&[]).is_none());
    }
}
