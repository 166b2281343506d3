use std::fmt;

/// RGB colour used for the box and label while the challenge is running.
pub const COLOR_CHALLENGE: [u8; 3] = [255, 165, 0];
/// RGB colour once attendance was found already recorded for today.
pub const COLOR_ALREADY_RECORDED: [u8; 3] = [0, 128, 0];
/// RGB colour once the challenge succeeded.
pub const COLOR_CONFIRMED: [u8; 3] = [0, 255, 0];

/// Human-readable status shown on the frame and reported to the polling client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Starting,
    Searching,
    PleaseMove,
    MoveMore,
    HoldStill,
    Validating { count: u32, required: u32 },
    Recorded,
    AlreadyRecorded,
    MultipleFaces,
    /// Challenge passed but the attendance record could not be written.
    SaveFailed,
    CameraUnavailable,
    CameraBusy,
    DetectorFailed,
    StreamEnded,
    Disconnected,
}

impl Status {
    pub fn color(&self) -> [u8; 3] {
        match self {
            Status::AlreadyRecorded => COLOR_ALREADY_RECORDED,
            Status::Recorded => COLOR_CONFIRMED,
            _ => COLOR_CHALLENGE,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Starting => f.write_str("Starting..."),
            Status::Searching => f.write_str("Looking for your face..."),
            Status::PleaseMove => f.write_str("Hello! Please turn your head"),
            Status::MoveMore => f.write_str("Please move your face a little"),
            Status::HoldStill => f.write_str("Great! Now hold still"),
            Status::Validating { count, required } => {
                write!(f, "Validating... ({count}/{required})")
            }
            Status::Recorded => f.write_str("Attendance recorded"),
            Status::AlreadyRecorded => f.write_str("Attendance already recorded today"),
            Status::MultipleFaces => f.write_str("Only one face in view, please"),
            Status::SaveFailed => f.write_str("Attendance confirmed, but saving failed"),
            Status::CameraUnavailable => f.write_str("Error: camera unavailable"),
            Status::CameraBusy => f.write_str("Camera busy, try again later"),
            Status::DetectorFailed => f.write_str("Error: face detection failed"),
            Status::StreamEnded => f.write_str("Stream ended"),
            Status::Disconnected => f.write_str("Camera disconnected"),
        }
    }
}
