//! facelog-core: face matching and attendance bookkeeping.
//!
//! The reference set, frame matcher and ledger are plain values with no I/O
//! beyond loading references and writing the attendance CSV. Face encoding
//! sits behind [`FaceEncoder`]; the shipped implementation runs SCRFD
//! detection and ArcFace recognition on ONNX Runtime.

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod ledger;
pub mod matcher;
pub mod recognizer;
pub mod reference;
pub mod types;

pub use detector::DetectorOptions;
pub use encoder::{EncoderError, FaceEncoder, OnnxEncoder};
pub use ledger::{Ledger, LedgerError, LedgerRecord};
pub use matcher::{CosineMatcher, EuclideanMatcher, FrameMatcher, MatchResult, Matcher, Metric};
pub use reference::{LoadOutcome, LoadPolicy, ReferenceError, ReferenceSet};
pub use types::{BoundingBox, DetectedFace, Embedding, FaceLabel, LabeledFace, ReferenceEntry};

use std::path::PathBuf;

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/facelog/models`, falling back to `~/.local/share/facelog/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelog")
        .join("models")
}
