//! `presence probe`: open the camera directly, read a few frames and
//! optionally save the last one. Fails if the daemon is streaming from the
//! same V4L2 device.

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use presence_core::{Frame, FrameRenderer};
use presence_hw::CameraConfig;

pub struct ProbeReport {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    pub elapsed_ms: u128,
    pub last: Option<Frame>,
}

pub fn capture(config: CameraConfig, frames: usize) -> Result<ProbeReport> {
    let opener = presence_hw::opener_for(config)?;
    let mut source = opener.open()?;

    let started = Instant::now();
    let mut report = ProbeReport {
        frames: 0,
        width: 0,
        height: 0,
        elapsed_ms: 0,
        last: None,
    };

    let result = (|| -> Result<()> {
        for _ in 0..frames {
            let Some(frame) = source.next_frame()? else {
                break;
            };
            report.frames += 1;
            report.width = frame.width;
            report.height = frame.height;
            report.last = Some(frame);
        }
        Ok(())
    })();
    source.release();
    result?;

    report.elapsed_ms = started.elapsed().as_millis();
    if report.frames == 0 {
        bail!("camera {} delivered no frames", opener.device());
    }
    Ok(report)
}

pub fn save_jpeg(frame: &Frame, path: &Path) -> Result<()> {
    let jpeg = FrameRenderer::default().encode(frame)?;
    std::fs::write(path, jpeg).with_context(|| format!("failed to write {}", path.display()))
}
