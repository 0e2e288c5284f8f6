//! Overlay rendering: boxes and named label bars drawn into a copy of the frame.

use ab_glyph::{Font, FontRef, PxScale};
use facelog_core::LabeledFace;
use facelog_hw::Frame;
use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::PathBuf;
use thiserror::Error;

const BOX_THICKNESS: i32 = 2;
const LABEL_BAR_HEIGHT: i32 = 35;
const LABEL_PADDING: i32 = 6;
const LABEL_SCALE: f32 = 24.0;
const INK: Luma<u8> = Luma([255]);
const TEXT: Luma<u8> = Luma([0]);

/// DejaVu Sans; license in `assets/DejaVuSans-LICENSE`.
static LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("label font unusable: {0}")]
    Font(#[from] ab_glyph::InvalidFont),
    #[error("failed to save snapshot: {0}")]
    Save(#[from] image::ImageError),
}

/// Presents each processed frame with its labeled faces.
pub trait Renderer {
    fn render(&mut self, frame: &Frame, faces: &[LabeledFace]) -> Result<(), RenderError>;

    /// Release any display resources. Safe to call more than once.
    fn close(&mut self);
}

/// Draws overlays and optionally keeps the latest annotated frame on disk.
pub struct OverlayRenderer {
    snapshot_path: Option<PathBuf>,
    font: FontRef<'static>,
    last_labels: Vec<String>,
    closed: bool,
}

impl OverlayRenderer {
    pub fn new(snapshot_path: Option<PathBuf>) -> Result<Self, RenderError> {
        Ok(Self {
            snapshot_path,
            font: label_font()?,
            last_labels: Vec::new(),
            closed: false,
        })
    }
}

impl Renderer for OverlayRenderer {
    fn render(&mut self, frame: &Frame, faces: &[LabeledFace]) -> Result<(), RenderError> {
        let labels: Vec<String> = faces.iter().map(|f| f.label.to_string()).collect();
        if labels != self.last_labels {
            tracing::debug!(seq = frame.sequence, faces = ?labels, "faces in view");
            self.last_labels = labels;
        }

        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        annotate(frame, faces, &self.font)?.save(path)?;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            tracing::debug!("renderer closed");
        }
    }
}

/// The bundled label typeface.
pub fn label_font() -> Result<FontRef<'static>, RenderError> {
    Ok(FontRef::try_from_slice(LABEL_FONT)?)
}

/// Copy of the frame with a box per face and the face's name in a filled bar
/// along the bottom of the box.
pub fn annotate(
    frame: &Frame,
    faces: &[LabeledFace],
    font: &impl Font,
) -> Result<GrayImage, RenderError> {
    let mut img = GrayImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or(
        RenderError::InvalidFrame {
            width: frame.width,
            height: frame.height,
        },
    )?;

    for face in faces {
        let left = face.region.x.round() as i32;
        let top = face.region.y.round() as i32;
        let width = face.region.right().round() as i32 - left;
        let height = face.region.bottom().round() as i32 - top;
        if width < 1 || height < 1 {
            continue;
        }

        for inset in 0..BOX_THICKNESS {
            let (w, h) = (width - 2 * inset, height - 2 * inset);
            if w < 1 || h < 1 {
                break;
            }
            let rect = Rect::at(left + inset, top + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut img, rect, INK);
        }

        let bar_height = LABEL_BAR_HEIGHT.min(height);
        let bar_top = top + height - bar_height;
        let bar = Rect::at(left, bar_top).of_size(width as u32, bar_height as u32);
        draw_filled_rect_mut(&mut img, bar, INK);
        draw_text_mut(
            &mut img,
            TEXT,
            left + LABEL_PADDING,
            bar_top + LABEL_PADDING,
            PxScale::from(LABEL_SCALE),
            font,
            face.label.as_str(),
        );
    }

    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facelog_core::{BoundingBox, FaceLabel};

    fn face_at(x: f32, y: f32, w: f32, h: f32, label: FaceLabel) -> LabeledFace {
        LabeledFace {
            region: BoundingBox {
                x,
                y,
                width: w,
                height: h,
                confidence: 0.9,
                landmarks: None,
            },
            label,
            distance: Some(0.2),
        }
    }

    fn alice_at(x: f32, y: f32, w: f32, h: f32) -> LabeledFace {
        face_at(x, y, w, h, FaceLabel::Known("alice".into()))
    }

    /// Pixels of the label bar for a 60x60 box at (10, 10) on a 100x100 frame.
    fn bar_pixels(img: &GrayImage) -> Vec<u8> {
        (35..70)
            .flat_map(|y| (10..70).map(move |x| (x, y)))
            .map(|(x, y)| img.get_pixel(x, y).0[0])
            .collect()
    }

    #[test]
    fn test_annotate_draws_outline_and_bar() {
        let font = label_font().unwrap();
        let frame = Frame::from_gray(vec![0u8; 100 * 100], 100, 100, 0);
        let img = annotate(&frame, &[alice_at(10.0, 10.0, 60.0, 60.0)], &font).unwrap();
        let px = |x: u32, y: u32| img.get_pixel(x, y).0[0];

        // two-pixel outline
        assert_eq!(px(10, 10), 255);
        assert_eq!(px(11, 40), 255);
        assert_eq!(px(69, 20), 255);
        assert_eq!(px(68, 20), 255);
        // inside the box above the bar stays untouched
        assert_eq!(px(40, 30), 0);
        assert_eq!(px(40, 34), 0);
        // label bar, away from the text
        assert_eq!(px(12, 67), 255);
        // outside the box
        assert_eq!(px(80, 80), 0);
        // the source frame is not modified
        assert!(frame.data.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_label_text_is_drawn_in_bar() {
        let font = label_font().unwrap();
        let frame = Frame::from_gray(vec![0u8; 100 * 100], 100, 100, 0);
        let img = annotate(&frame, &[alice_at(10.0, 10.0, 60.0, 60.0)], &font).unwrap();
        assert!(bar_pixels(&img).iter().any(|&p| p < 255));
    }

    #[test]
    fn test_different_labels_render_differently() {
        let font = label_font().unwrap();
        let frame = Frame::from_gray(vec![0u8; 100 * 100], 100, 100, 0);
        let render = |label: FaceLabel| {
            let img = annotate(&frame, &[face_at(10.0, 10.0, 60.0, 60.0, label)], &font).unwrap();
            bar_pixels(&img)
        };

        let alice = render(FaceLabel::Known("alice".into()));
        let bob = render(FaceLabel::Known("bob".into()));
        let unknown = render(FaceLabel::Unknown);
        assert_ne!(alice, bob);
        assert_ne!(alice, unknown);
        assert_eq!(alice, render(FaceLabel::Known("alice".into())));
    }

    #[test]
    fn test_annotate_clips_to_frame() {
        let font = label_font().unwrap();
        let frame = Frame::from_gray(vec![0u8; 20 * 20], 20, 20, 0);
        let img = annotate(&frame, &[alice_at(-15.0, -5.0, 50.0, 50.0)], &font).unwrap();
        assert_eq!(img.dimensions(), (20, 20));
        assert!(img.pixels().any(|p| p.0[0] == 255));
    }

    #[test]
    fn test_degenerate_box_skipped() {
        let font = label_font().unwrap();
        let frame = Frame::from_gray(vec![0u8; 16], 4, 4, 0);
        let img = annotate(&frame, &[alice_at(1.0, 1.0, 0.2, 0.2)], &font).unwrap();
        assert!(img.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_short_buffer_is_error() {
        let font = label_font().unwrap();
        let frame = Frame::from_gray(vec![0u8; 3], 2, 2, 0);
        assert!(matches!(
            annotate(&frame, &[], &font),
            Err(RenderError::InvalidFrame { width: 2, height: 2 })
        ));
    }

    #[test]
    fn test_render_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.png");
        let mut renderer = OverlayRenderer::new(Some(path.clone())).unwrap();

        let frame = Frame::from_gray(vec![50u8; 64 * 48], 64, 48, 3);
        renderer
            .render(&frame, &[alice_at(5.0, 5.0, 40.0, 40.0)])
            .unwrap();
        renderer.close();
        renderer.close();

        let saved = image::open(&path).unwrap().to_luma8();
        assert_eq!(saved.dimensions(), (64, 48));
        assert_eq!(saved.get_pixel(5, 5).0[0], 255);
        assert_eq!(saved.get_pixel(60, 2).0[0], 50);
    }

    #[test]
    fn test_render_without_snapshot_is_noop() {
        let mut renderer = OverlayRenderer::new(None).unwrap();
        let frame = Frame::from_gray(vec![0u8; 4], 2, 2, 0);
        assert!(renderer.render(&frame, &[]).is_ok());
    }
}
