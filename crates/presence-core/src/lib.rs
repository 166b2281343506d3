//! presence-core: Face detection, liveness challenge and frame rendering.
//!
//! Detects faces in camera frames, runs the move-then-hold-still liveness
//! challenge over consecutive detections, and draws the result onto the
//! frame for streaming.

pub mod detector;
pub mod liveness;
pub mod render;
#[cfg(feature = "onnx")]
pub mod scrfd;
pub mod status;
pub mod types;

pub use detector::{BrightRegionDetector, DetectorError, FaceDetector};
pub use liveness::{LivenessPolicy, LivenessSession, Stage, Step};
pub use render::{FrameRenderer, RenderError};
#[cfg(feature = "onnx")]
pub use scrfd::ScrfdDetector;
pub use status::Status;
pub use types::{BoundingBox, Frame, Point};
