//! V4L2 camera backend.
//!
//! Opens a local device node (e.g. `/dev/video0`), negotiates the requested
//! size, and converts RGB3, YUYV or MJPG buffers to RGB8 frames. Reads are
//! bounded by the configured timeout; expiry is reported as `Unavailable`.

use ouroboros::self_referencing;
use presence_core::Frame;

use crate::camera::{CameraConfig, CameraError, CameraOpener, FrameSource};

const BUFFER_COUNT: u32 = 4;

pub struct V4l2Camera {
    config: CameraConfig,
}

impl V4l2Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl CameraOpener for V4l2Camera {
    fn device(&self) -> &str {
        &self.config.device
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device_path = self.config.device.as_str();
        let unavailable = |e: std::io::Error| CameraError::unavailable(device_path, e.to_string());

        let device = v4l::Device::with_path(device_path).map_err(unavailable)?;
        let mut format = device.format().map_err(unavailable)?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                tracing::warn!(device = device_path, error = %err, "failed to set capture format");
                device.format().map_err(unavailable)?
            }
        };

        let fourcc = format.fourcc.str().unwrap_or("????").to_string();
        let pixel_format = match fourcc.as_str() {
            "RGB3" => PixelFormat::Rgb3,
            "YUYV" => PixelFormat::Yuyv,
            "MJPG" => PixelFormat::Mjpg,
            _ => {
                return Err(CameraError::UnsupportedFormat {
                    device: device_path.to_string(),
                    fourcc,
                })
            }
        };

        let timeout = self.config.read_timeout;
        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)?;
                stream.set_timeout(timeout);
                Ok::<_, std::io::Error>(stream)
            },
        }
        .try_build()
        .map_err(unavailable)?;

        tracing::info!(
            device = device_path,
            width = format.width,
            height = format.height,
            fourcc = %fourcc,
            "camera opened"
        );

        Ok(Box::new(V4l2Source {
            device: device_path.to_string(),
            width: format.width,
            height: format.height,
            pixel_format,
            state: Some(state),
            frame_count: 0,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum PixelFormat {
    Rgb3,
    Yuyv,
    Mjpg,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

struct V4l2Source {
    device: String,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    state: Option<DeviceState>,
    frame_count: u64,
}

impl FrameSource for V4l2Source {
    fn device(&self) -> &str {
        &self.device
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CameraError::unavailable(&self.device, "released"))?;
        let data = state
            .with_stream_mut(|stream| stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|e| CameraError::unavailable(&self.device, e.to_string()))?;

        let rgb = match self.pixel_format {
            PixelFormat::Rgb3 => data,
            PixelFormat::Yuyv => yuyv_to_rgb(&data),
            PixelFormat::Mjpg => image::load_from_memory_with_format(&data, image::ImageFormat::Jpeg)
                .map_err(|e| CameraError::unavailable(&self.device, format!("mjpeg decode: {e}")))?
                .to_rgb8()
                .into_raw(),
        };

        let frame = Frame::new(rgb, self.width, self.height);
        if !frame.is_well_formed() {
            return Err(CameraError::unavailable(
                &self.device,
                format!("short frame: {} bytes", frame.data.len()),
            ));
        }

        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            tracing::info!(device = %self.device, frames = self.frame_count, "camera released");
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.release();
    }
}

/// Convert packed YUYV 4:2:2 to RGB8 (BT.601, studio range).
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for chunk in yuyv.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        for y in [y0, y1] {
            rgb.extend_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    rgb
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
