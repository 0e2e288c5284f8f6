//! Reference set: labeled embeddings loaded once from a directory of images.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::ReferenceEntry;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("reference directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("encoder failed on {path}: {source}")]
    Encoder {
        path: String,
        #[source]
        source: EncoderError,
    },
    #[error("no face found in reference image {0}")]
    NoFace(String),
    #[error("face in reference image {0} could not be encoded")]
    Unencodable(String),
}

/// What a single reference image produced.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(ReferenceEntry),
    /// The image decoded but the detector found no face in it.
    NoFace { path: PathBuf },
    /// A face was found but no usable embedding came out of it.
    Unencodable { path: PathBuf },
}

/// How the loader treats images that yield no usable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Skip the image with a warning.
    #[default]
    Lenient,
    /// Abort loading on the first unusable image.
    Strict,
}

/// Known faces, in the order they were loaded.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    entries: Vec<ReferenceEntry>,
}

impl ReferenceSet {
    pub fn new(entries: Vec<ReferenceEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Load every image in `dir`, labeling each by its file stem.
    ///
    /// Files are visited in sorted name order so the reference order (and thus
    /// tie-breaking at match time) is stable across runs. Hidden files are ignored.
    pub fn load_dir<E: FaceEncoder + ?Sized>(
        dir: &Path,
        encoder: &mut E,
        policy: LoadPolicy,
    ) -> Result<Self, ReferenceError> {
        if !dir.is_dir() {
            return Err(ReferenceError::DirectoryNotFound(dir.display().to_string()));
        }

        let io_err = |source: std::io::Error| ReferenceError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut paths = Vec::new();
        for dir_entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = dir_entry.map_err(io_err)?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if path.is_file() && !hidden {
                paths.push(path);
            }
        }
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in &paths {
            let outcome = match load_image(path, encoder) {
                Ok(outcome) => outcome,
                Err(e @ ReferenceError::Decode { .. }) if policy == LoadPolicy::Lenient => {
                    tracing::warn!(error = %e, "skipping unreadable reference image");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match (outcome, policy) {
                (LoadOutcome::Loaded(entry), _) => {
                    tracing::debug!(label = %entry.label, dim = entry.embedding.dim(), "reference loaded");
                    entries.push(entry);
                }
                (LoadOutcome::NoFace { path }, LoadPolicy::Strict) => {
                    return Err(ReferenceError::NoFace(path.display().to_string()));
                }
                (LoadOutcome::Unencodable { path }, LoadPolicy::Strict) => {
                    return Err(ReferenceError::Unencodable(path.display().to_string()));
                }
                (LoadOutcome::NoFace { path }, LoadPolicy::Lenient) => {
                    tracing::warn!(path = %path.display(), "no face found in reference image; skipping");
                }
                (LoadOutcome::Unencodable { path }, LoadPolicy::Lenient) => {
                    tracing::warn!(path = %path.display(), "reference face could not be encoded; skipping");
                }
            }
        }

        tracing::info!(
            dir = %dir.display(),
            files = paths.len(),
            loaded = entries.len(),
            "reference set loaded"
        );

        Ok(Self { entries })
    }
}

/// Decode one reference image and encode its most confident face.
pub fn load_image<E: FaceEncoder + ?Sized>(
    path: &Path,
    encoder: &mut E,
) -> Result<LoadOutcome, ReferenceError> {
    let label = label_for(path);

    let gray = image::open(path)
        .map_err(|source| ReferenceError::Decode {
            path: path.display().to_string(),
            source,
        })?
        .to_luma8();

    let faces = encoder
        .encode(gray.as_raw(), gray.width(), gray.height())
        .map_err(|source| ReferenceError::Encoder {
            path: path.display().to_string(),
            source,
        })?;

    let best = faces.into_iter().min_by(|a, b| {
        b.region
            .confidence
            .partial_cmp(&a.region.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let Some(face) = best else {
        return Ok(LoadOutcome::NoFace {
            path: path.to_path_buf(),
        });
    };

    match face.embedding {
        Some(embedding) if embedding.is_well_formed() => {
            Ok(LoadOutcome::Loaded(ReferenceEntry { label, embedding }))
        }
        _ => Ok(LoadOutcome::Unencodable {
            path: path.to_path_buf(),
        }),
    }
}

/// `known_faces/alice.jpg` → `alice`.
fn label_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
