//! Frame type and pixel processing: YUYV conversion, dark detection, downsampling.

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a grayscale buffer, classifying it as dark or not.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        }
    }

    /// Shrink by an integer factor, averaging each `factor × factor` block.
    ///
    /// Trailing rows/columns that don't fill a whole block are dropped, so
    /// coordinates found on the result scale back up by exactly `factor`.
    /// A factor of 0 or 1 returns a copy.
    pub fn downsample(&self, factor: u32) -> Frame {
        if factor <= 1 {
            return self.clone();
        }
        let f = factor as usize;
        let w = self.width as usize;
        let out_w = w / f;
        let out_h = self.height as usize / f;
        let area = (f * f) as u32;

        let mut data = Vec::with_capacity(out_w * out_h);
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut sum = 0u32;
                for y in oy * f..(oy + 1) * f {
                    let row = &self.data[y * w + ox * f..y * w + (ox + 1) * f];
                    sum += row.iter().map(|&p| p as u32).sum::<u32>();
                }
                data.push(((sum + area / 2) / area) as u8);
            }
        }

        Frame {
            data,
            width: out_w as u32,
            height: out_h as u32,
            sequence: self.sequence,
            is_dark: self.is_dark,
        }
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert 16-bit little-endian grayscale to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True if more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
