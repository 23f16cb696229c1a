//! Stub face models and image fixtures shared by the daemon's tests.

use eventlens_core::detector::DetectorError;
use eventlens_core::recognizer::RecognizerError;
use eventlens_core::{
    BoundingBox, Embedding, EmbeddingExtractor, FaceDetector, FaceModels, Frame, ModelBackend,
    ModelError,
};
use image::{ImageFormat, Luma};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Frames brighter than this contain a "face".
const FACE_BRIGHTNESS: f32 = 20.0;

/// Reports one whole-frame face for bright frames, none for dark ones.
pub struct BrightDetector {
    pub delay: Duration,
}

impl FaceDetector for BrightDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        std::thread::sleep(self.delay);
        if frame.avg_brightness() <= FACE_BRIGHTNESS {
            return Ok(vec![]);
        }
        let (w, h) = (frame.width as f32, frame.height as f32);
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: w,
            height: h,
            confidence: 0.9,
            landmarks: Some([
                (w * 0.3, h * 0.4),
                (w * 0.7, h * 0.4),
                (w * 0.5, h * 0.55),
                (w * 0.35, h * 0.75),
                (w * 0.65, h * 0.75),
            ]),
        }])
    }
}

/// Two-component descriptor derived from mean brightness, so photos of
/// similar brightness land close together.
pub struct BrightnessExtractor {
    pub calls: Arc<AtomicUsize>,
}

impl EmbeddingExtractor for BrightnessExtractor {
    fn extract(&self, frame: &Frame, _face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let b = frame.avg_brightness() / 255.0;
        Ok(Embedding::new(vec![b, 1.0 - b]))
    }

    fn dimension(&self) -> usize {
        2
    }
}

pub fn stub_models(detect_delay: Duration, calls: Arc<AtomicUsize>) -> FaceModels {
    FaceModels {
        detector: Box::new(BrightDetector { delay: detect_delay }),
        extractor: Box::new(BrightnessExtractor { calls }),
    }
}

/// Backend producing [`stub_models`], or failing while `available` is false.
pub struct StubBackend {
    pub available: std::sync::atomic::AtomicBool,
}

impl StubBackend {
    pub fn new(available: bool) -> Arc<Self> {
        Arc::new(Self { available: available.into() })
    }
}

impl ModelBackend for StubBackend {
    fn load(&self) -> Result<FaceModels, ModelError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ModelError::Unavailable("stub models missing".into()));
        }
        Ok(stub_models(Duration::ZERO, Arc::new(AtomicUsize::new(0))))
    }

    fn describe(&self) -> String {
        "stub".into()
    }
}

/// A uniform gray PNG.
pub fn png(width: u32, height: u32, level: u8) -> Vec<u8> {
    let img = image::GrayImage::from_pixel(width, height, Luma([level]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}
