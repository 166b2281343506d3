//! Synthetic camera for `stub://` device specs.
//!
//! Renders a dark background with a bright square standing in for a face.
//! The scene is scripted per stream so the whole pipeline can run without
//! hardware:
//!
//! - `live` (default): empty for 3 frames, face at one spot for 3 frames,
//!   then shifted 40 px and held still.
//! - `photo`: the face appears and never moves.
//! - `empty`: no face at all.
//!
//! `stub://?frames=N` ends the stream after N frames; otherwise it is
//! unbounded. Options combine: `stub://?scene=photo&frames=100`.

use presence_core::Frame;

use crate::camera::{CameraConfig, CameraError, CameraOpener, FrameSource, STUB_SCHEME};

const FACE_SIDE: u32 = 120;
const BACKGROUND: [u8; 3] = [40, 40, 48];
const SKIN: [u8; 3] = [232, 205, 180];
const EMPTY_FRAMES: u64 = 3;
const FIRST_POSE_FRAMES: u64 = 3;
const MOVE_PX: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
    Live,
    Photo,
    Empty,
}

/// Opener for the synthetic camera.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    device: String,
    width: u32,
    height: u32,
    scene: Scene,
    max_frames: Option<u64>,
}

impl SyntheticCamera {
    pub fn from_config(config: &CameraConfig) -> Result<Self, CameraError> {
        let rest = config
            .device
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| CameraError::InvalidSpec(config.device.clone()))?;
        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");

        let mut scene = Scene::Live;
        let mut max_frames = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("frames", n)) => {
                    let n = n
                        .parse()
                        .map_err(|_| CameraError::InvalidSpec(format!("bad frame count '{n}'")))?;
                    max_frames = Some(n);
                }
                Some(("scene", "live")) => scene = Scene::Live,
                Some(("scene", "photo")) => scene = Scene::Photo,
                Some(("scene", "empty")) => scene = Scene::Empty,
                _ => {
                    return Err(CameraError::InvalidSpec(format!(
                        "unknown stub option '{pair}'"
                    )))
                }
            }
        }

        if config.width < FACE_SIDE + MOVE_PX || config.height < FACE_SIDE {
            return Err(CameraError::InvalidSpec(format!(
                "synthetic frames must be at least {}x{FACE_SIDE}",
                FACE_SIDE + MOVE_PX
            )));
        }

        Ok(Self {
            device: config.device.clone(),
            width: config.width,
            height: config.height,
            scene,
            max_frames,
        })
    }

    pub fn scene(&self) -> Scene {
        self.scene
    }
}

impl CameraOpener for SyntheticCamera {
    fn device(&self) -> &str {
        &self.device
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        tracing::info!(
            device = %self.device,
            width = self.width,
            height = self.height,
            scene = ?self.scene,
            "camera opened (synthetic)"
        );
        Ok(Box::new(SyntheticSource {
            camera: self.clone(),
            frame_count: 0,
            released: false,
        }))
    }
}

struct SyntheticSource {
    camera: SyntheticCamera,
    frame_count: u64,
    released: bool,
}

impl SyntheticSource {
    /// Top-left corner of the face for the current frame, if visible.
    fn face_origin(&self) -> Option<(u32, u32)> {
        let t = self.frame_count;
        let base_x = (self.camera.width - FACE_SIDE - MOVE_PX) / 2;
        let base_y = (self.camera.height - FACE_SIDE) / 2;
        match self.camera.scene {
            Scene::Empty => None,
            _ if t < EMPTY_FRAMES => None,
            Scene::Photo => Some((base_x, base_y)),
            Scene::Live if t < EMPTY_FRAMES + FIRST_POSE_FRAMES => Some((base_x, base_y)),
            Scene::Live => Some((base_x + MOVE_PX, base_y)),
        }
    }

    fn render(&self) -> Frame {
        let mut frame = Frame::filled(self.camera.width, self.camera.height, BACKGROUND);
        if let Some((x0, y0)) = self.face_origin() {
            let width = self.camera.width as usize;
            for y in y0..y0 + FACE_SIDE {
                let row = (y as usize * width + x0 as usize) * 3;
                for px in frame.data[row..row + (FACE_SIDE * 3) as usize].chunks_exact_mut(3) {
                    px.copy_from_slice(&SKIN);
                }
            }
        }
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn device(&self) -> &str {
        &self.camera.device
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.released {
            return Err(CameraError::unavailable(&self.camera.device, "released"));
        }
        if self.camera.max_frames.is_some_and(|max| self.frame_count >= max) {
            return Ok(None);
        }
        let frame = self.render();
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            tracing::info!(
                device = %self.camera.device,
                frames = self.frame_count,
                "camera released (synthetic)"
            );
        }
    }
}
