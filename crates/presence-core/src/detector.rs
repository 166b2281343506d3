use thiserror::Error;

use crate::types::{BoundingBox, Frame};

/// Default minimum confidence for a detection to be reported.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("frame buffer is {len} bytes, expected {width}x{height}x3")]
    InvalidFrame { len: usize, width: u32, height: u32 },
    #[error("failed to load detection model: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
}

/// Maps a frame to zero or more face boxes.
///
/// Implementations hold only the loaded model between calls. Boxes below the
/// configured confidence are never returned. The order is backend-defined;
/// callers act on the first box only.
pub trait FaceDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

pub(crate) fn check_frame(frame: &Frame) -> Result<(), DetectorError> {
    if frame.is_well_formed() {
        Ok(())
    } else {
        Err(DetectorError::InvalidFrame {
            len: frame.data.len(),
            width: frame.width,
            height: frame.height,
        })
    }
}

/// Model-free detector for the synthetic camera.
///
/// Treats the bounding box of all bright pixels as a single face. The
/// confidence is the fraction of the box actually covered by bright pixels,
/// so a solid rectangle scores 1.0 and scattered noise scores low.
pub struct BrightRegionDetector {
    luma_threshold: u8,
    min_area: u32,
    confidence: f32,
}

impl BrightRegionDetector {
    pub fn new(confidence: f32) -> Self {
        Self {
            luma_threshold: 180,
            min_area: 400,
            confidence,
        }
    }
}

impl Default for BrightRegionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE)
    }
}

impl FaceDetector for BrightRegionDetector {
    fn name(&self) -> &'static str {
        "bright-region"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        check_frame(frame)?;

        let width = frame.width as i32;
        let mut min_x = i32::MAX;
        let mut min_y = i32::MAX;
        let mut max_x = i32::MIN;
        let mut max_y = i32::MIN;
        let mut bright = 0u32;

        for (i, px) in frame.data.chunks_exact(3).enumerate() {
            let luma = (px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000;
            if luma < self.luma_threshold as u32 {
                continue;
            }
            let x = i as i32 % width;
            let y = i as i32 / width;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            bright += 1;
        }

        if bright < self.min_area {
            return Ok(Vec::new());
        }

        let w = max_x - min_x + 1;
        let h = max_y - min_y + 1;
        let confidence = bright as f32 / (w * h) as f32;
        if confidence < self.confidence {
            return Ok(Vec::new());
        }

        Ok(vec![BoundingBox {
            x: min_x,
            y: min_y,
            width: w,
            height: h,
            confidence,
        }])
    }
}
