//! Frame type and image processing: pixel conversion, grayscale and histogram
//! equalization.

use std::time::Instant;

/// Pixel layout of a [`Frame`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 1 byte per pixel.
    Gray8,
    /// 3 bytes per pixel, R G B.
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// A captured camera or file frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Row-major pixel data (width * height * bytes_per_pixel).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    /// Build a frame, checking the buffer length against the dimensions.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            timestamp: Instant::now(),
            sequence,
        })
    }

    /// Copy of this frame as packed RGB, replicating gray into all channels.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgb8 => self.data.clone(),
            PixelFormat::Gray8 => self.data.iter().flat_map(|&g| [g, g, g]).collect(),
        }
    }
}

/// Single-channel 8-bit image the detectors consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 full-range coefficients.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

// BT.601 luma weights in 14-bit fixed point (sum = 1 << 14).
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

/// Reduce a frame to the single-channel representation detectors require.
pub fn to_grayscale(frame: &Frame) -> Result<GrayImage, FrameError> {
    let pixels = frame.width as usize * frame.height as usize;
    let needed = pixels * frame.format.bytes_per_pixel();
    if frame.data.len() < needed {
        return Err(FrameError::InvalidLength {
            expected: needed,
            actual: frame.data.len(),
        });
    }

    let data = match frame.format {
        PixelFormat::Gray8 => frame.data[..pixels].to_vec(),
        PixelFormat::Rgb8 => frame.data[..needed]
            .chunks_exact(3)
            .map(|p| {
                let luma = p[0] as u32 * LUMA_R
                    + p[1] as u32 * LUMA_G
                    + p[2] as u32 * LUMA_B
                    + (1 << (LUMA_SHIFT - 1));
                (luma >> LUMA_SHIFT) as u8
            })
            .collect(),
    };

    Ok(GrayImage {
        data,
        width: frame.width,
        height: frame.height,
    })
}

/// Global histogram equalization, in place.
///
/// Fixed and parameterless: the lowest occupied intensity maps to 0 and
/// the cumulative distribution is stretched over 0–255. A constant image is
/// left unchanged.
pub fn equalize_histogram(image: &mut GrayImage) {
    let total = image.data.len();
    if total == 0 {
        return;
    }

    let mut hist = [0usize; 256];
    for &p in &image.data {
        hist[p as usize] += 1;
    }

    let Some(first) = hist.iter().position(|&count| count > 0) else {
        return;
    };
    if hist[first] == total {
        return;
    }

    let scale = 255.0 / (total - hist[first]) as f32;
    let mut lut = [0u8; 256];
    let mut sum = 0usize;
    for i in (first + 1)..256 {
        sum += hist[i];
        lut[i] = clamp_u8(sum as f32 * scale);
    }

    for p in image.data.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Grayscale conversion followed by histogram equalization.
pub fn normalize(frame: &Frame) -> Result<GrayImage, FrameError> {
    let mut gray = to_grayscale(frame)?;
    equalize_histogram(&mut gray);
    Ok(gray)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
