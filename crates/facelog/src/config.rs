use facelog_core::Metric;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Runtime configuration.
///
/// Resolved in layers: built-in defaults, then an optional TOML file, then
/// `FACELOG_*` environment variables, then command-line flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory of reference images, one person per file (default: known_faces).
    pub known_faces_dir: PathBuf,
    /// Attendance CSV written at exit (default: attendance.csv).
    pub attendance_path: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may negotiate another.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Replay image files from this directory instead of opening the camera.
    pub replay_dir: Option<PathBuf>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub metric: Metric,
    /// A face matches only if its nearest reference is strictly closer than this.
    pub distance_threshold: f32,
    /// Minimum detector score for a face candidate.
    pub detection_confidence: f32,
    /// Frames are shrunk by this factor before detection.
    pub downsample_factor: u32,
    /// Frames discarded at camera start while exposure settles.
    pub warmup_frames: usize,
    /// Abort startup if any reference image yields no usable face.
    pub strict_references: bool,
    /// Save the latest annotated frame here.
    pub snapshot_path: Option<PathBuf>,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            known_faces_dir: PathBuf::from("known_faces"),
            attendance_path: PathBuf::from("attendance.csv"),
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            replay_dir: None,
            model_dir: facelog_core::default_model_dir(),
            metric: Metric::Euclidean,
            // L2 distance between unit ArcFace embeddings; 1.10 ≈ cosine 0.40
            distance_threshold: 1.10,
            detection_confidence: 0.5,
            downsample_factor: 4,
            warmup_frames: 4,
            strict_references: false,
            snapshot_path: None,
            max_frames: None,
        }
    }
}

impl Config {
    /// Defaults, overlaid by `path` (if any), then by the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override fields from `FACELOG_*` variables as returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FACELOG_KNOWN_FACES_DIR") {
            self.known_faces_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACELOG_ATTENDANCE_PATH") {
            self.attendance_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACELOG_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACELOG_REPLAY_DIR") {
            self.replay_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACELOG_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACELOG_SNAPSHOT_PATH") {
            self.snapshot_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACELOG_STRICT_REFERENCES") {
            self.strict_references = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        env_parse(&lookup, "FACELOG_METRIC", &mut self.metric)?;
        env_parse(&lookup, "FACELOG_CAPTURE_WIDTH", &mut self.capture_width)?;
        env_parse(&lookup, "FACELOG_CAPTURE_HEIGHT", &mut self.capture_height)?;
        env_parse(&lookup, "FACELOG_DISTANCE_THRESHOLD", &mut self.distance_threshold)?;
        env_parse(&lookup, "FACELOG_DETECTION_CONFIDENCE", &mut self.detection_confidence)?;
        env_parse(&lookup, "FACELOG_DOWNSAMPLE_FACTOR", &mut self.downsample_factor)?;
        env_parse(&lookup, "FACELOG_WARMUP_FRAMES", &mut self.warmup_frames)?;

        if let Some(v) = lookup("FACELOG_MAX_FRAMES") {
            let frames = v
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::Invalid(format!("FACELOG_MAX_FRAMES={v}: {e}")))?;
            self.max_frames = Some(frames);
        }
        Ok(())
    }

    /// Reject settings the capture loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.downsample_factor == 0 {
            return Err(ConfigError::Invalid("downsample_factor must be at least 1".into()));
        }
        if !self.distance_threshold.is_finite() || self.distance_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "distance_threshold must be a positive number, got {}",
                self.distance_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.detection_confidence) {
            return Err(ConfigError::Invalid(format!(
                "detection_confidence must be in [0, 1), got {}",
                self.detection_confidence
            )));
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            return Err(ConfigError::Invalid("capture size must be non-zero".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(facelog_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(facelog_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parse<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("{key}={raw}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.known_faces_dir, PathBuf::from("known_faces"));
        assert_eq!(config.attendance_path, PathBuf::from("attendance.csv"));
        assert_eq!(config.downsample_factor, 4);
        assert_eq!(config.metric, Metric::Euclidean);
        assert!(config.max_frames.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[
                ("FACELOG_KNOWN_FACES_DIR", "/srv/faces"),
                ("FACELOG_METRIC", "cosine"),
                ("FACELOG_DISTANCE_THRESHOLD", "0.35"),
                ("FACELOG_DOWNSAMPLE_FACTOR", "2"),
                ("FACELOG_STRICT_REFERENCES", "1"),
                ("FACELOG_MAX_FRAMES", "30"),
            ]))
            .unwrap();
        assert_eq!(config.known_faces_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.metric, Metric::Cosine);
        assert!((config.distance_threshold - 0.35).abs() < 1e-6);
        assert_eq!(config.downsample_factor, 2);
        assert!(config.strict_references);
        assert_eq!(config.max_frames, Some(30));
    }

    #[test]
    fn test_env_bad_number_is_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(lookup(&[("FACELOG_WARMUP_FRAMES", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("FACELOG_WARMUP_FRAMES"));
    }

    #[test]
    fn test_file_layer_keeps_unset_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facelog.toml");
        std::fs::write(
            &path,
            "attendance_path = \"out/today.csv\"\nmetric = \"cosine\"\nsnapshot_path = \"last.png\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.attendance_path, PathBuf::from("out/today.csv"));
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.snapshot_path, Some(PathBuf::from("last.png")));
        assert_eq!(config.camera_device, "/dev/video0");
    }

    #[test]
    fn test_metric_names_agree_across_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facelog.toml");
        std::fs::write(&path, "metric = \"l2\"\n").unwrap();
        let from_file = Config::from_file(&path).unwrap();

        let mut from_env = Config {
            metric: Metric::Cosine,
            ..Config::default()
        };
        from_env.apply_env(lookup(&[("FACELOG_METRIC", "l2")])).unwrap();

        assert_eq!(from_file.metric, Metric::Euclidean);
        assert_eq!(from_env.metric, Metric::Euclidean);
    }

    #[test]
    fn test_file_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facelog.toml");
        std::fs::write(&path, "tolerance = 0.6\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            downsample_factor: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            distance_threshold: f32::NAN,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_paths() {
        let config = Config {
            model_dir: PathBuf::from("/opt/models"),
            ..Config::default()
        };
        assert_eq!(config.scrfd_model_path(), "/opt/models/det_10g.onnx");
        assert_eq!(config.arcface_model_path(), "/opt/models/w600k_r50.onnx");
    }
}
