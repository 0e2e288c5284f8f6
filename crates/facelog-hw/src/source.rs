//! Frame sources: anything that yields grayscale frames on demand.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "pgm"];

/// A blocking supplier of frames.
pub trait VideoSource {
    /// Block until the next frame is available. `Ok(None)` means the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Stop capturing and free the underlying device. Safe to call more than once.
    fn release(&mut self);
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Replays image files from a directory as if they came from a camera.
///
/// Files are visited once, in sorted name order. Non-image files are skipped.
pub struct ReplaySource {
    paths: Vec<PathBuf>,
    index: usize,
}

impl ReplaySource {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        if !dir.is_dir() {
            return Err(CameraError::DeviceNotFound(dir.display().to_string()));
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        paths.sort();

        tracing::info!(dir = %dir.display(), frames = paths.len(), "replay source opened");
        Ok(Self { paths, index: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl VideoSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let Some(path) = self.paths.get(self.index) else {
            return Ok(None);
        };
        let sequence = self.index as u32;
        self.index += 1;

        let gray = image::open(path)
            .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", path.display())))?
            .to_luma8();
        let (width, height) = gray.dimensions();
        tracing::trace!(path = %path.display(), width, height, "replayed frame");

        Ok(Some(Frame::from_gray(gray.into_raw(), width, height, sequence)))
    }

    fn release(&mut self) {
        self.index = self.paths.len();
    }
}
