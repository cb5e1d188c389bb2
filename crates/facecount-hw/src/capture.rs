use crate::frame::{Frame, FrameError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no images found in {0}")]
    NoImages(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A source of frames, opened by the implementation's constructor.
pub trait CaptureSource: Send {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Next frame, or `Ok(None)` once the stream has ended.
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Release the underlying device or files. Further reads return `Ok(None)`.
    fn close(&mut self);
}

impl<C: CaptureSource + ?Sized> CaptureSource for Box<C> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
