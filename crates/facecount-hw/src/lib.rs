//! facecount-hw: Frame acquisition and normalization.
//!
//! Provides V4L2 camera capture, a still-image directory source, and the
//! grayscale + histogram-equalization step that prepares frames for the
//! detectors.

pub mod camera;
pub mod capture;
pub mod frame;
pub mod image_dir;

pub use camera::{Camera, DeviceInfo};
pub use capture::{CaptureError, CaptureSource};
pub use frame::{equalize_histogram, normalize, to_grayscale, Frame, FrameError, GrayImage, PixelFormat};
pub use image_dir::ImageDirSource;
