//! presence-hw: Camera access and the exclusive device pool.
//!
//! A camera is opened through a [`CameraOpener`] and read through the
//! [`FrameSource`] it returns. Access is serialised process-wide by an
//! [`ExclusivePool`] of size one.

pub mod camera;
pub mod pool;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use camera::{opener_for, CameraConfig, CameraError, CameraOpener, FrameSource};
pub use pool::{AcquirePolicy, ExclusivePool, Lease, PoolError};
pub use synthetic::SyntheticCamera;
