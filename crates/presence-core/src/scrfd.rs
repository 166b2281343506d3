//! SCRFD face detector running on ONNX Runtime.
//!
//! Expects the insightface `det_10g.onnx` export: one `1x3x640x640` input and
//! nine outputs ordered as scores, box distances and landmarks for strides
//! 8, 16 and 32, with two anchors per feature-map cell.

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;

use crate::detector::{check_frame, DetectorError, FaceDetector};
use crate::types::{BoundingBox, Frame};

const INPUT_SIZE: u32 = 640;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const NMS_IOU_THRESH: f32 = 0.4;

pub struct ScrfdDetector {
    session: Session,
    confidence: f32,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path, confidence: f32) -> Result<Self, DetectorError> {
        let session = open_session(model_path)
            .map_err(|e| DetectorError::ModelLoad(format!("{}: {e}", model_path.display())))?;
        tracing::debug!(path = %model_path.display(), confidence, "SCRFD session ready");

        Ok(Self {
            session,
            confidence,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn name(&self) -> &'static str {
        "scrfd"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        check_frame(frame)?;

        let (tensor, scale) = preprocess(frame)?;
        let input = ort::value::Tensor::from_array(tensor)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        if outputs.len() < STRIDES.len() * 2 {
            return Err(DetectorError::UnexpectedOutput(format!(
                "expected at least {} outputs, got {}",
                STRIDES.len() * 2,
                outputs.len()
            )));
        }

        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let scores = outputs[level]
                .try_extract_array::<f32>()
                .map_err(|e| DetectorError::Inference(e.to_string()))?;
            let distances = outputs[level + STRIDES.len()]
                .try_extract_array::<f32>()
                .map_err(|e| DetectorError::Inference(e.to_string()))?;
            let scores = scores
                .as_slice()
                .ok_or_else(|| DetectorError::UnexpectedOutput("non-contiguous scores".into()))?;
            let distances = distances
                .as_slice()
                .ok_or_else(|| DetectorError::UnexpectedOutput("non-contiguous boxes".into()))?;

            decode_level(scores, distances, stride, self.confidence, &mut candidates)?;
        }

        let kept = nms(candidates, NMS_IOU_THRESH);
        Ok(kept
            .into_iter()
            .filter_map(|c| to_frame_box(&c, scale, frame.width, frame.height))
            .collect())
    }
}

fn open_session(model_path: &Path) -> ort::Result<Session> {
    Session::builder()?.commit_from_file(model_path)
}

/// Candidate box in model input coordinates.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// Letterbox into the top-left of a 640x640 canvas, normalised NCHW.
/// Returns the tensor and the resize factor applied to the frame.
fn preprocess(frame: &Frame) -> Result<(Array4<f32>, f32), DetectorError> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| DetectorError::InvalidFrame {
            len: frame.data.len(),
            width: frame.width,
            height: frame.height,
        })?;

    let scale = (INPUT_SIZE as f32 / frame.width as f32).min(INPUT_SIZE as f32 / frame.height as f32);
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = image::imageops::resize(&image, new_w, new_h, FilterType::Triangle);

    let s = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - 127.5) / 128.0;
        }
    }

    Ok((tensor, scale))
}

fn decode_level(
    scores: &[f32],
    distances: &[f32],
    stride: u32,
    threshold: f32,
    out: &mut Vec<Candidate>,
) -> Result<(), DetectorError> {
    let grid = (INPUT_SIZE / stride) as usize;
    let expected = grid * grid * ANCHORS_PER_CELL;
    if scores.len() < expected || distances.len() < expected * 4 {
        return Err(DetectorError::UnexpectedOutput(format!(
            "stride {stride}: {} scores / {} distances for {expected} anchors",
            scores.len(),
            distances.len()
        )));
    }

    let stride = stride as f32;
    for (i, &score) in scores.iter().take(expected).enumerate() {
        if score < threshold {
            continue;
        }
        let cell = i / ANCHORS_PER_CELL;
        let cx = (cell % grid) as f32 * stride;
        let cy = (cell / grid) as f32 * stride;
        let d = &distances[i * 4..i * 4 + 4];
        out.push(Candidate {
            x1: cx - d[0] * stride,
            y1: cy - d[1] * stride,
            x2: cx + d[2] * stride,
            y2: cy + d[3] * stride,
            score,
        });
    }
    Ok(())
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let area_a = (a.x2 - a.x1).max(0.0) * (a.y2 - a.y1).max(0.0);
    let area_b = (b.x2 - b.x1).max(0.0) * (b.y2 - b.y1).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy NMS; output is sorted by descending score.
fn nms(mut candidates: Vec<Candidate>, iou_thresh: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| iou(k, &c) <= iou_thresh) {
            kept.push(c);
        }
    }
    kept
}

fn to_frame_box(c: &Candidate, scale: f32, width: u32, height: u32) -> Option<BoundingBox> {
    let x1 = (c.x1 / scale).clamp(0.0, width as f32);
    let y1 = (c.y1 / scale).clamp(0.0, height as f32);
    let x2 = (c.x2 / scale).clamp(0.0, width as f32);
    let y2 = (c.y2 / scale).clamp(0.0, height as f32);
    let w = (x2 - x1) as i32;
    let h = (y2 - y1) as i32;
    if w <= 0 || h <= 0 {
        return None;
    }
    Some(BoundingBox {
        x: x1 as i32,
        y: y1 as i32,
        width: w,
        height: h,
        confidence: c.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }

    #[test]
    fn test_nms_suppresses_overlap_and_sorts() {
        let kept = nms(
            vec![
                cand(0.0, 0.0, 10.0, 10.0, 0.6),
                cand(1.0, 1.0, 11.0, 11.0, 0.9),
                cand(50.0, 50.0, 60.0, 60.0, 0.7),
            ],
            NMS_IOU_THRESH,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_decode_level_applies_threshold_and_stride() {
        let grid = (INPUT_SIZE / 32) as usize;
        let n = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.1f32; n];
        let mut distances = vec![0.0f32; n * 4];
        // Anchor 3 sits in cell 1 -> centre (32, 0)
        scores[3] = 0.8;
        distances[12..16].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let mut out = Vec::new();
        decode_level(&scores, &distances, 32, 0.5, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        let c = out[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (16.0, 0.0, 64.0, 64.0));
    }

    #[test]
    fn test_decode_level_rejects_short_output() {
        let mut out = Vec::new();
        let err = decode_level(&[0.9; 4], &[0.0; 16], 8, 0.5, &mut out).unwrap_err();
        assert!(matches!(err, DetectorError::UnexpectedOutput(_)));
    }

    #[test]
    fn test_to_frame_box_rescales_and_clamps() {
        let b = to_frame_box(&cand(-10.0, 20.0, 100.0, 120.0, 0.9), 0.5, 150, 200).unwrap();
        assert_eq!((b.x, b.y, b.width, b.height), (0, 40, 150, 160));
    }
}
