//! Still-image capture source: replays every image in a directory as one
//! frame each, in file-name order, then ends the stream.

use crate::capture::{CaptureError, CaptureSource};
use crate::frame::{Frame, PixelFormat};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub struct ImageDirSource {
    dir: PathBuf,
    pending: VecDeque<PathBuf>,
    sequence: u32,
}

impl ImageDirSource {
    /// Index all decodable image files in `dir`.
    pub fn open(dir: &Path) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir).map_err(|source| CaptureError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CaptureError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && image::ImageFormat::from_path(&path).is_ok() {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(CaptureError::NoImages(dir.to_path_buf()));
        }
        files.sort();

        tracing::info!(dir = %dir.display(), images = files.len(), "opened image directory");

        Ok(Self {
            dir: dir.to_path_buf(),
            pending: files.into(),
            sequence: 0,
        })
    }

    /// Images not yet read.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl CaptureSource for ImageDirSource {
    fn describe(&self) -> String {
        format!("image directory {}", self.dir.display())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };

        let decoded = image::open(&path).map_err(|source| CaptureError::Decode {
            path: path.clone(),
            source,
        })?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();

        let frame = Frame::new(rgb.into_raw(), width, height, PixelFormat::Rgb8, self.sequence)?;
        tracing::trace!(path = %path.display(), seq = self.sequence, "read image frame");
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(skipped = self.pending.len(), "image directory closed early");
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32, value: u8) {
        let img = image::RgbImage::from_pixel(w, h, image::Rgb([value, value, value]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_reads_images_in_name_order_then_ends() {
        let tmp = tempfile::tempdir().unwrap();
        write_png(tmp.path(), "b.png", 4, 2, 200);
        write_png(tmp.path(), "a.png", 2, 2, 10);
        std::fs::write(tmp.path().join("notes.txt"), "not an image").unwrap();

        let mut source = ImageDirSource::open(tmp.path()).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.read_frame().unwrap().unwrap();
        assert_eq!((first.width, first.height), (2, 2));
        assert_eq!(first.format, PixelFormat::Rgb8);
        assert_eq!(first.data[0], 10);
        assert_eq!(first.sequence, 0);

        let second = source.read_frame().unwrap().unwrap();
        assert_eq!((second.width, second.height), (4, 2));
        assert_eq!(second.sequence, 1);

        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_empty_directory_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageDirSource::open(tmp.path()),
            Err(CaptureError::NoImages(_))
        ));
    }

    #[test]
    fn test_missing_directory_is_error() {
        assert!(matches!(
            ImageDirSource::open(Path::new("/nonexistent/frames")),
            Err(CaptureError::Io { .. })
        ));
    }

    #[test]
    fn test_corrupt_image_is_decode_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("broken.png"), b"not really a png").unwrap();
        let mut source = ImageDirSource::open(tmp.path()).unwrap();
        assert!(matches!(source.read_frame(), Err(CaptureError::Decode { .. })));
    }

    #[test]
    fn test_close_ends_stream() {
        let tmp = tempfile::tempdir().unwrap();
        write_png(tmp.path(), "a.png", 2, 2, 10);
        let mut source = ImageDirSource::open(tmp.path()).unwrap();
        source.close();
        assert!(source.read_frame().unwrap().is_none());
    }
}
