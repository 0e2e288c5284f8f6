//! Nearest-reference matching for faces detected in a frame.

use crate::reference::ReferenceSet;
use crate::types::{DetectedFace, Embedding, FaceLabel, LabeledFace, ReferenceEntry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result of matching a probe embedding against the reference set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: FaceLabel,
    /// Distance to the nearest comparable reference (lower = more similar).
    pub distance: Option<f32>,
    /// Position of the nearest reference in the set, whether accepted or not.
    pub index: Option<usize>,
}

impl MatchResult {
    fn unknown() -> Self {
        Self {
            label: FaceLabel::Unknown,
            distance: None,
            index: None,
        }
    }
}

/// Strategy for comparing a probe embedding against the reference set.
///
/// Implementors only supply the distance; the nearest-neighbour scan is shared.
pub trait Matcher {
    /// Dissimilarity between two embeddings of equal dimension. Lower = closer.
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32;

    /// Find the closest reference and accept it only if strictly below `threshold`.
    ///
    /// References of a different dimension than the probe are skipped. Ties keep
    /// the earliest entry. Malformed probes and empty sets yield `Unknown`.
    fn compare(&self, probe: &Embedding, references: &[ReferenceEntry], threshold: f32) -> MatchResult {
        if !probe.is_well_formed() {
            return MatchResult::unknown();
        }

        let mut best: Option<(usize, f32)> = None;
        for (i, entry) in references.iter().enumerate() {
            if entry.embedding.dim() != probe.dim() {
                continue;
            }
            let d = self.distance(probe, &entry.embedding);
            if d.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, d)) if d < threshold => MatchResult {
                label: FaceLabel::Known(references[idx].label.clone()),
                distance: Some(d),
                index: Some(idx),
            },
            Some((idx, d)) => MatchResult {
                label: FaceLabel::Unknown,
                distance: Some(d),
                index: Some(idx),
            },
            None => MatchResult::unknown(),
        }
    }
}

/// L2 distance matcher.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b)
    }
}

/// Cosine distance matcher: `1 - cosine_similarity`, in [0, 2].
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        1.0 - a.similarity(b)
    }
}

/// Distance metric selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    #[serde(alias = "l2")]
    Euclidean,
    Cosine,
}

impl Metric {
    pub fn matcher(self) -> Box<dyn Matcher + Send> {
        match self {
            Metric::Euclidean => Box::new(EuclideanMatcher),
            Metric::Cosine => Box::new(CosineMatcher),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => f.write_str("euclidean"),
            Metric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(format!("unknown metric '{other}' (expected euclidean or cosine)")),
        }
    }
}

/// Labels every face of a frame against a fixed reference set.
///
/// Pure: holds no per-frame state, so the same matcher serves the whole session.
pub struct FrameMatcher {
    references: ReferenceSet,
    matcher: Box<dyn Matcher + Send>,
    threshold: f32,
}

impl FrameMatcher {
    pub fn new(references: ReferenceSet, metric: Metric, threshold: f32) -> Self {
        Self::with_matcher(references, metric.matcher(), threshold)
    }

    pub fn with_matcher(
        references: ReferenceSet,
        matcher: Box<dyn Matcher + Send>,
        threshold: f32,
    ) -> Self {
        Self {
            references,
            matcher,
            threshold,
        }
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Label a single face. Faces without an embedding are `Unknown`.
    pub fn match_face(&self, face: &DetectedFace) -> LabeledFace {
        let result = match &face.embedding {
            Some(embedding) => {
                self.matcher
                    .compare(embedding, self.references.entries(), self.threshold)
            }
            None => MatchResult::unknown(),
        };

        LabeledFace {
            region: face.region.clone(),
            label: result.label,
            distance: result.distance,
        }
    }

    /// Label every face of a frame, preserving input order.
    pub fn match_faces(&self, faces: &[DetectedFace]) -> Vec<LabeledFace> {
        faces.iter().map(|face| self.match_face(face)).collect()
    }
}
