//! Active liveness challenge: move, then hold still.
//!
//! A printed photograph held in front of the camera fails the movement
//! phase. A replayed or shaky video fails the stillness phase. No identity
//! matching is involved; the challenge only establishes that *a* live face
//! is present.
//!
//! # Threat Coverage
//!
//! - **Blocks:** static photographs, jittery screen replays.
//! - **Does not block:** a steady video replay that happens to move once and
//!   then freeze, 3D masks, or a second person standing in for the user.

use crate::status::Status;
use crate::types::{BoundingBox, Point};

/// Default Manhattan distance (pixels) between consecutive face centres that
/// counts as deliberate movement.
pub const DEFAULT_MIN_MOVEMENT_PX: i32 = 20;

/// Default number of still frames that must be exceeded before confirming.
pub const DEFAULT_STILL_FRAMES: u32 = 30;

/// Challenge stage. The discriminant is the step number reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Searching = 1,
    AwaitMovement = 2,
    AwaitStillness = 3,
    Confirmed = 4,
}

impl Stage {
    pub fn step(self) -> u8 {
        self as u8
    }
}

/// Challenge thresholds.
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub min_movement_px: i32,
    pub still_frames_required: u32,
    /// Treat more than one face in view as if no face were seen.
    pub reject_multiple_faces: bool,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            min_movement_px: DEFAULT_MIN_MOVEMENT_PX,
            still_frames_required: DEFAULT_STILL_FRAMES,
            reject_multiple_faces: false,
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone)]
pub struct Step {
    pub stage: Stage,
    pub status: Status,
    pub face_count: usize,
    /// The face acted on this tick, if any.
    pub face: Option<BoundingBox>,
    /// Set only on the tick that completes the stillness phase.
    pub request_attendance: bool,
}

/// Per-stream challenge state. Never persisted: every stream starts over.
#[derive(Debug, Clone)]
pub struct LivenessSession {
    policy: LivenessPolicy,
    stage: Stage,
    last_face_center: Option<Point>,
    still_frame_count: u32,
    already_recorded_today: bool,
}

impl LivenessSession {
    pub fn new(policy: LivenessPolicy, already_recorded_today: bool) -> Self {
        Self {
            policy,
            stage: Stage::Searching,
            last_face_center: None,
            still_frame_count: 0,
            already_recorded_today,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn last_face_center(&self) -> Option<Point> {
        self.last_face_center
    }

    pub fn still_frame_count(&self) -> u32 {
        self.still_frame_count
    }

    pub fn already_recorded_today(&self) -> bool {
        self.already_recorded_today
    }

    /// Advance one tick with this frame's detections, in detector order.
    ///
    /// Only the first detection is acted on; the rest are counted.
    pub fn advance(&mut self, faces: &[BoundingBox]) -> Step {
        let face_count = faces.len();
        let face = faces.first().copied();

        if self.stage == Stage::Confirmed {
            return self.step(self.confirmed_status(), face_count, face, false);
        }

        let Some(face) = face else {
            return self.demote(Status::Searching, 0);
        };

        if self.policy.reject_multiple_faces && face_count > 1 {
            return self.demote(Status::MultipleFaces, face_count);
        }

        if self.already_recorded_today {
            self.stage = Stage::Confirmed;
            tracing::debug!("liveness: attendance already recorded, skipping challenge");
            return self.step(Status::AlreadyRecorded, face_count, Some(face), false);
        }

        let center = face.center();
        match self.stage {
            Stage::Searching => {
                self.last_face_center = Some(center);
                self.stage = Stage::AwaitMovement;
                self.step(Status::PleaseMove, face_count, Some(face), false)
            }
            Stage::AwaitMovement => {
                let moved = self
                    .last_face_center
                    .map(|last| last.manhattan_distance(&center))
                    .unwrap_or(0);
                self.last_face_center = Some(center);

                if moved > self.policy.min_movement_px {
                    self.still_frame_count = 0;
                    self.stage = Stage::AwaitStillness;
                    tracing::debug!(moved, "liveness: movement detected");
                    self.step(Status::HoldStill, face_count, Some(face), false)
                } else {
                    self.step(Status::MoveMore, face_count, Some(face), false)
                }
            }
            Stage::AwaitStillness => {
                self.still_frame_count += 1;
                if self.still_frame_count > self.policy.still_frames_required {
                    self.stage = Stage::Confirmed;
                    tracing::debug!(
                        still_frames = self.still_frame_count,
                        "liveness: stillness held, confirmed"
                    );
                    self.step(Status::Recorded, face_count, Some(face), true)
                } else {
                    let status = Status::Validating {
                        count: self.still_frame_count,
                        required: self.policy.still_frames_required,
                    };
                    self.step(status, face_count, Some(face), false)
                }
            }
            Stage::Confirmed => self.step(self.confirmed_status(), face_count, Some(face), false),
        }
    }

    fn confirmed_status(&self) -> Status {
        if self.already_recorded_today {
            Status::AlreadyRecorded
        } else {
            Status::Recorded
        }
    }

    /// Losing the face drops all progress.
    fn demote(&mut self, status: Status, face_count: usize) -> Step {
        if self.stage != Stage::Searching {
            tracing::debug!(from = ?self.stage, "liveness: face lost, back to searching");
        }
        self.stage = Stage::Searching;
        self.last_face_center = None;
        self.still_frame_count = 0;
        self.step(status, face_count, None, false)
    }

    fn step(
        &self,
        status: Status,
        face_count: usize,
        face: Option<BoundingBox>,
        request_attendance: bool,
    ) -> Step {
        Step {
            stage: self.stage,
            status,
            face_count,
            face,
            request_attendance,
        }
    }
}
