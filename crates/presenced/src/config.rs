use std::path::PathBuf;
use std::time::Duration;

use presence_core::liveness::{DEFAULT_MIN_MOVEMENT_PX, DEFAULT_STILL_FRAMES};
use presence_core::LivenessPolicy;
use presence_hw::{AcquirePolicy, CameraConfig};

use crate::engine::DriverSettings;

/// Which face detector backend to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// SCRFD ONNX model (requires the `onnx` feature).
    Scrfd,
    /// Bright-region detector, paired with the synthetic camera.
    Stub,
}

impl DetectorKind {
    /// Explicit choice wins; otherwise synthetic cameras get the stub detector.
    fn select(value: Option<&str>, camera_device: &str) -> Self {
        match value {
            Some("stub") => DetectorKind::Stub,
            Some("scrfd") => DetectorKind::Scrfd,
            Some(other) => {
                tracing::warn!(value = other, "unknown PRESENCE_DETECTOR, using scrfd");
                DetectorKind::Scrfd
            }
            None if camera_device.starts_with(presence_hw::camera::STUB_SCHEME) => {
                DetectorKind::Stub
            }
            None => DetectorKind::Scrfd,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path, or `stub://...` for the synthetic camera.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Per-frame read timeout.
    pub read_timeout_ms: u64,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector: DetectorKind,
    pub detection_confidence: f32,
    /// Manhattan distance (pixels) that counts as deliberate movement.
    pub min_movement_px: i32,
    /// Still frames that must be exceeded before attendance is confirmed.
    pub still_frames: u32,
    pub reject_multiple_faces: bool,
    /// Fail immediately when another stream holds the camera.
    pub camera_fail_fast: bool,
    /// How long a second stream waits for the camera. 0 waits forever.
    pub camera_wait_secs: u64,
    pub jpeg_quality: u8,
    /// Encoded frames buffered between the driver thread and the HTTP body.
    pub stream_buffer: usize,
    /// TrueType font for status labels, replacing the bundled one.
    pub font_path: Option<PathBuf>,
    /// Path to the SQLite attendance database.
    pub db_path: PathBuf,
    pub listen_addr: String,
    /// Request header carrying the authenticated user name.
    pub identity_header: String,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("PRESENCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| presence_models::default_model_dir(is_root()));

        let db_path = std::env::var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| presence_models::data_home().join("presence/attendance.db"));

        let camera_device = std::env::var("PRESENCE_CAMERA_DEVICE")
            .unwrap_or_else(|_| "/dev/video0".to_string());
        let detector = DetectorKind::select(
            std::env::var("PRESENCE_DETECTOR").ok().as_deref(),
            &camera_device,
        );

        Self {
            camera_device,
            frame_width: env_u32("PRESENCE_FRAME_WIDTH", 640),
            frame_height: env_u32("PRESENCE_FRAME_HEIGHT", 480),
            read_timeout_ms: env_u64("PRESENCE_READ_TIMEOUT_MS", 2000),
            model_dir,
            detector,
            detection_confidence: env_f32(
                "PRESENCE_DETECTION_CONFIDENCE",
                presence_core::detector::DEFAULT_CONFIDENCE,
            ),
            min_movement_px: env_i32("PRESENCE_MIN_MOVEMENT_PX", DEFAULT_MIN_MOVEMENT_PX),
            still_frames: env_u32("PRESENCE_STILL_FRAMES", DEFAULT_STILL_FRAMES),
            reject_multiple_faces: env_flag("PRESENCE_REJECT_MULTIPLE_FACES", false),
            camera_fail_fast: std::env::var("PRESENCE_CAMERA_POLICY")
                .map(|v| v == "fail-fast")
                .unwrap_or(false),
            camera_wait_secs: env_u64("PRESENCE_CAMERA_WAIT_SECS", 30),
            jpeg_quality: env_u32("PRESENCE_JPEG_QUALITY", 80).clamp(1, 100) as u8,
            stream_buffer: env_usize("PRESENCE_STREAM_BUFFER", 2).max(1),
            font_path: std::env::var("PRESENCE_FONT_PATH").ok().map(PathBuf::from),
            db_path,
            listen_addr: std::env::var("PRESENCE_LISTEN_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8090".to_string()),
            identity_header: std::env::var("PRESENCE_IDENTITY_HEADER")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or_else(|_| "x-authenticated-user".to_string()),
        }
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            device: self.camera_device.clone(),
            width: self.frame_width,
            height: self.frame_height,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn liveness_policy(&self) -> LivenessPolicy {
        LivenessPolicy {
            min_movement_px: self.min_movement_px,
            still_frames_required: self.still_frames,
            reject_multiple_faces: self.reject_multiple_faces,
        }
    }

    pub fn acquire_policy(&self) -> AcquirePolicy {
        if self.camera_fail_fast {
            AcquirePolicy::FailFast
        } else if self.camera_wait_secs == 0 {
            AcquirePolicy::Block
        } else {
            AcquirePolicy::BlockFor(Duration::from_secs(self.camera_wait_secs))
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            liveness: self.liveness_policy(),
            acquire: self.acquire_policy(),
            buffer_frames: self.stream_buffer,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detection_model_path(&self) -> PathBuf {
        presence_models::DETECTION_MODEL.path_in(&self.model_dir)
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.as_str(), "0" | "false" | "off" | ""))
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
