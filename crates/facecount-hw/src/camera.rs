//! V4L2 camera capture via the `v4l` crate.

use crate::capture::{CaptureError, CaptureSource};
use crate::frame::{self, Frame, PixelFormat};
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Number of mmap buffers queued with the driver.
const STREAM_BUFFERS: u32 = 4;
/// `/dev/videoN` nodes probed by [`Camera::list_devices`].
const MAX_VIDEO_NODES: u32 = 16;

/// A capture-capable V4L2 node found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Layout of the buffers the driver hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Packed YUYV 4:2:2, two bytes per pixel.
    Yuyv,
    Grey,
    /// Little-endian 16-bit luma.
    Y16,
}

impl WireFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    /// Decode one driver buffer into frame pixels.
    fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, PixelFormat), CaptureError> {
        let pixels = width as usize * height as usize;
        let need = |bytes: usize| {
            if buf.len() < bytes {
                Err(CaptureError::CaptureFailed(format!(
                    "{self:?} buffer too short: expected {bytes}, got {}",
                    buf.len()
                )))
            } else {
                Ok(())
            }
        };

        match self {
            Self::Yuyv => Ok((frame::yuyv_to_rgb(buf, width, height)?, PixelFormat::Rgb8)),
            Self::Grey => {
                need(pixels)?;
                Ok((buf[..pixels].to_vec(), PixelFormat::Gray8))
            }
            Self::Y16 => {
                need(pixels * 2)?;
                // high byte of each sample
                let gray = buf[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect();
                Ok((gray, PixelFormat::Gray8))
            }
        }
    }
}

/// Streaming V4L2 camera. The mmap stream stays open until
/// [`close`](CaptureSource::close) so frames are not re-negotiated per read.
pub struct Camera {
    // dropped before `device`
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    wire_format: WireFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0"), negotiate a format near
    /// `width`×`height`, and start streaming.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                CaptureError::DeviceBusy
            } else {
                CaptureError::DeviceNotFound(format!("{device_path}: {msg}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::StreamingNotSupported);
        }

        let (wire_format, width, height) = negotiate(&device, width, height)?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width,
            height,
            format = ?wire_format,
            "camera streaming"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        Ok(Self {
            stream: Some(stream),
            device: Some(device),
            width,
            height,
            device_path: device_path.to_string(),
            wire_format,
        })
    }

    /// List V4L2 nodes that support video capture.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_VIDEO_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// Ask for YUYV at the requested size; accept GREY or Y16 if the driver
/// insists. Returns the wire format and the size the driver settled on.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(WireFormat, u32, u32), CaptureError> {
    let mut fmt = device
        .format()
        .map_err(|e| CaptureError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = width;
    fmt.height = height;

    let got = device
        .set_format(&fmt)
        .map_err(|e| CaptureError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

    let wire = WireFormat::from_fourcc(got.fourcc).ok_or_else(|| {
        CaptureError::FormatNegotiationFailed(format!(
            "unsupported pixel format {} (need YUYV, GREY or Y16)",
            got.fourcc
        ))
    })?;
    Ok((wire, got.width, got.height))
}

impl CaptureSource for Camera {
    fn describe(&self) -> String {
        format!("camera {} ({}x{}, {:?})", self.device_path, self.width, self.height, self.wire_format)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let (data, format) = self.wire_format.decode(buf, self.width, self.height)?;

        Ok(Some(Frame::new(data, self.width, self.height, format, meta.sequence)?))
    }

    fn close(&mut self) {
        let had_stream = self.stream.take().is_some();
        let had_device = self.device.take().is_some();
        if had_stream || had_device {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }
}
