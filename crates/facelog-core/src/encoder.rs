//! Face encoding seam: grayscale pixels in, located and encoded faces out.

use crate::detector::{DetectorError, DetectorOptions, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("frame buffer too short: {width}x{height} needs {expected} bytes, got {actual}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Locates faces in a grayscale frame and produces a feature vector for each.
///
/// Returned faces are ordered by detection confidence, highest first.
pub trait FaceEncoder {
    fn encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, EncoderError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, EncoderError> {
        (**self).encode(pixels, width, height)
    }
}

pub(crate) fn check_frame(pixels: &[u8], width: u32, height: u32) -> Result<(), EncoderError> {
    let expected = width as usize * height as usize;
    if expected == 0 || pixels.len() < expected {
        return Err(EncoderError::InvalidFrame {
            width,
            height,
            expected,
            actual: pixels.len(),
        });
    }
    Ok(())
}

/// SCRFD detection followed by ArcFace embedding, both on ONNX Runtime.
pub struct OnnxEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEncoder {
    /// Load both models. Fails fast if either file is missing or invalid.
    pub fn load(
        scrfd_path: &str,
        arcface_path: &str,
        options: DetectorOptions,
    ) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(scrfd_path, options)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEncoder for OnnxEncoder {
    fn encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, EncoderError> {
        check_frame(pixels, width, height)?;

        let regions = self.detector.detect(pixels, width, height)?;
        let mut faces = Vec::with_capacity(regions.len());

        for region in regions {
            // A face that cannot be encoded is still reported, it just can't match.
            let embedding = match self.recognizer.extract(pixels, width, height, &region) {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    tracing::debug!(error = %e, confidence = region.confidence, "face not encoded");
                    None
                }
            };
            faces.push(DetectedFace { region, embedding });
        }

        Ok(faces)
    }
}
