use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;

use crate::types::{BoundingBox, Frame};

const LABEL_HEIGHT: i32 = 20;
const LABEL_SCALE: f32 = 16.0;
/// Advance of one monospace glyph at `LABEL_SCALE`, rounded up.
const GLYPH_ADVANCE: i32 = 10;

/// DejaVu Sans Mono Bold, see `assets/DejaVuSansMono-LICENSE.txt`.
static BUILTIN_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono-Bold.ttf");
const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("frame buffer is {len} bytes, expected {width}x{height}x3")]
    InvalidFrame { len: usize, width: u32, height: u32 },
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to read font {path}: {source}")]
    FontIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid font file: {0}")]
    InvalidFont(String),
}

/// Draws the face box and status label, then encodes the frame as JPEG.
///
/// Holds no per-stream state. Labels use the bundled monospace font unless
/// another one is loaded with [`with_font_file`](Self::with_font_file).
pub struct FrameRenderer {
    font: Option<FontArc>,
    jpeg_quality: u8,
}

impl Default for FrameRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameRenderer {
    pub fn new(jpeg_quality: u8) -> Self {
        let font = match FontArc::try_from_slice(BUILTIN_FONT) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!(error = %e, "bundled label font unusable, labels will have no text");
                None
            }
        };
        Self {
            font,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Replace the bundled font with a TTF/OTF file.
    pub fn with_font_file(mut self, path: &Path) -> Result<Self, RenderError> {
        let bytes = std::fs::read(path).map_err(|source| RenderError::FontIo {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontArc::try_from_vec(bytes).map_err(|e| RenderError::InvalidFont(e.to_string()))?;
        self.font = Some(font);
        Ok(self)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw the box and label when a face is present.
    pub fn render(
        &self,
        frame: Frame,
        face: Option<&BoundingBox>,
        status: &str,
        color: [u8; 3],
    ) -> Result<Frame, RenderError> {
        let Some(face) = face else {
            return Ok(frame);
        };

        let (width, height) = (frame.width, frame.height);
        let len = frame.data.len();
        let mut image = RgbImage::from_raw(width, height, frame.data)
            .ok_or(RenderError::InvalidFrame { len, width, height })?;

        let color = Rgb(color);
        if face.width > 0 && face.height > 0 {
            let outer = Rect::at(face.x, face.y).of_size(face.width as u32, face.height as u32);
            draw_hollow_rect_mut(&mut image, outer, color);
            if face.width > 2 && face.height > 2 {
                let inner = Rect::at(face.x + 1, face.y + 1)
                    .of_size(face.width as u32 - 2, face.height as u32 - 2);
                draw_hollow_rect_mut(&mut image, inner, color);
            }
        }

        // Label sits above the box, or below it when the box touches the top edge
        let label_y = if face.y >= LABEL_HEIGHT {
            face.y - LABEL_HEIGHT
        } else {
            face.y + face.height
        };
        let label_w = face.width.max(status.chars().count() as i32 * GLYPH_ADVANCE + 4).max(1);
        draw_filled_rect_mut(
            &mut image,
            Rect::at(face.x, label_y).of_size(label_w as u32, LABEL_HEIGHT as u32),
            color,
        );
        if let Some(font) = &self.font {
            draw_text_mut(
                &mut image,
                Rgb([0, 0, 0]),
                face.x + 2,
                label_y + 2,
                PxScale::from(LABEL_SCALE),
                font,
                status,
            );
        }

        Ok(Frame::new(image.into_raw(), width, height))
    }

    /// Encode a frame as a self-contained JPEG.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, RenderError> {
        if !frame.is_well_formed() {
            return Err(RenderError::InvalidFrame {
                len: frame.data.len(),
                width: frame.width,
                height: frame.height,
            });
        }
        let mut buf = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality);
        encoder.encode(
            &frame.data,
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )?;
        Ok(buf)
    }
}
