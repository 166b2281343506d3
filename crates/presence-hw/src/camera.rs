use std::time::Duration;

use presence_core::Frame;
use thiserror::Error;

use crate::synthetic::SyntheticCamera;

/// Prefix selecting the built-in synthetic camera.
pub const STUB_SCHEME: &str = "stub://";

#[derive(Error, Debug)]
pub enum CameraError {
    /// The device could not be opened, failed mid-stream, or timed out.
    #[error("camera {device} unavailable: {reason}")]
    Unavailable { device: String, reason: String },
    #[error("camera {device} delivers unsupported pixel format {fourcc}")]
    UnsupportedFormat { device: String, fourcc: String },
    #[error("invalid camera device spec: {0}")]
    InvalidSpec(String),
}

impl CameraError {
    pub fn unavailable(device: &str, reason: impl Into<String>) -> Self {
        CameraError::Unavailable {
            device: device.to_string(),
            reason: reason.into(),
        }
    }
}

/// Capture settings shared by all camera backends.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// V4L2 device path, or `stub://` for the synthetic camera.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Per-frame read timeout; expiry is reported as `Unavailable`.
    pub read_timeout: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// An open camera producing frames on demand.
pub trait FrameSource: Send {
    fn device(&self) -> &str;

    /// Next frame, or `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Close the device. Safe to call more than once.
    fn release(&mut self);
}

/// Opens a camera for exclusive use.
pub trait CameraOpener: Send + Sync {
    fn device(&self) -> &str;

    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Select the backend for `config.device`.
pub fn opener_for(config: CameraConfig) -> Result<Box<dyn CameraOpener>, CameraError> {
    if config.device.starts_with(STUB_SCHEME) {
        return Ok(Box::new(SyntheticCamera::from_config(&config)?));
    }

    #[cfg(feature = "v4l2")]
    {
        Ok(Box::new(crate::v4l2::V4l2Camera::new(config)))
    }

    #[cfg(not(feature = "v4l2"))]
    {
        Err(CameraError::InvalidSpec(format!(
            "{}: built without the `v4l2` feature; only {STUB_SCHEME} cameras are available",
            config.device
        )))
    }
}
