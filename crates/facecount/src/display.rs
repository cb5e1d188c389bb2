//! Annotation instructions and the display sinks that consume them.

use crate::overlay;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use facecount_core::Rect;
use facecount_hw::Frame;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const FACE_LABEL: &str = "Face";
pub const COUNT_PREFIX: &str = "People detected: ";
/// Top-left corner of the count banner, independent of face boxes.
pub const COUNT_ORIGIN: (i32, i32) = (10, 10);

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("frame buffer does not match {width}x{height}")]
    BadFrame { width: u32, height: u32 },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to move {path} into place: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One drawing instruction for the display sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// Outline plus label for one accepted face.
    FaceBox { rect: Rect, label: String },
    /// The per-frame face count.
    CountOverlay { count: usize, text: String, origin: (i32, i32) },
}

/// Annotations for one fused result: a box per face, then exactly one count.
pub fn annotate(fused: &[Rect]) -> Vec<Annotation> {
    let mut out: Vec<Annotation> = fused
        .iter()
        .map(|rect| Annotation::FaceBox {
            rect: *rect,
            label: FACE_LABEL.to_string(),
        })
        .collect();
    out.push(Annotation::CountOverlay {
        count: fused.len(),
        text: format!("{COUNT_PREFIX}{}", fused.len()),
        origin: COUNT_ORIGIN,
    });
    out
}

/// Draw annotations onto an RGB copy of `frame`.
pub fn rasterize(frame: &Frame, annotations: &[Annotation]) -> Result<image::RgbImage, DisplayError> {
    let mut img = image::RgbImage::from_raw(frame.width, frame.height, frame.to_rgb()).ok_or(
        DisplayError::BadFrame {
            width: frame.width,
            height: frame.height,
        },
    )?;

    for annotation in annotations {
        match annotation {
            Annotation::FaceBox { rect, label } => overlay::face_box(&mut img, rect, label),
            Annotation::CountOverlay { text, origin, .. } => overlay::banner(&mut img, *origin, text),
        }
    }
    Ok(img)
}

/// Sending half of the stop channel; held by whoever may end the session.
#[derive(Clone)]
pub struct StopHandle(Sender<()>);

impl StopHandle {
    pub fn request(&self) {
        let _ = self.0.try_send(());
    }
}

/// Receiving half of the stop channel, polled once per frame.
pub struct StopSignal {
    rx: Receiver<()>,
    requested: bool,
}

/// Create a connected stop handle/signal pair.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (StopHandle(tx), StopSignal { rx, requested: false })
}

impl StopSignal {
    /// Wait at most `wait` for a stop request. Once seen, stays set.
    ///
    /// A disconnected handle is not a request: nobody is left to ask.
    pub fn poll(&mut self, wait: Duration) -> bool {
        if self.requested {
            return true;
        }
        let got = if wait.is_zero() {
            match self.rx.try_recv() {
                Ok(()) => true,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => false,
            }
        } else {
            match self.rx.recv_timeout(wait) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
            }
        };
        self.requested = got;
        got
    }
}

/// Consumer of annotated frames.
pub trait DisplaySink: Send {
    fn render(&mut self, frame: &Frame, annotations: &[Annotation]) -> Result<(), DisplayError>;

    /// Non-blocking (bounded-wait) check for a user stop request.
    fn poll_termination_requested(&mut self) -> bool;

    /// Flush and release display resources.
    fn close(&mut self) {}
}

impl<S: DisplaySink + ?Sized> DisplaySink for Box<S> {
    fn render(&mut self, frame: &Frame, annotations: &[Annotation]) -> Result<(), DisplayError> {
        (**self).render(frame, annotations)
    }

    fn poll_termination_requested(&mut self) -> bool {
        (**self).poll_termination_requested()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

fn face_count(annotations: &[Annotation]) -> Option<usize> {
    annotations.iter().find_map(|a| match a {
        Annotation::CountOverlay { count, .. } => Some(*count),
        Annotation::FaceBox { .. } => None,
    })
}

/// Sink without a screen: logs the count, at info level when it changes.
pub struct HeadlessSink {
    stop: StopSignal,
    poll_wait: Duration,
    last_count: Option<usize>,
}

impl HeadlessSink {
    pub fn new(stop: StopSignal, poll_wait: Duration) -> Self {
        Self {
            stop,
            poll_wait,
            last_count: None,
        }
    }
}

impl DisplaySink for HeadlessSink {
    fn render(&mut self, frame: &Frame, annotations: &[Annotation]) -> Result<(), DisplayError> {
        let count = face_count(annotations).unwrap_or(0);
        if self.last_count != Some(count) {
            tracing::info!(seq = frame.sequence, faces = count, "face count changed");
            self.last_count = Some(count);
        } else {
            tracing::debug!(seq = frame.sequence, faces = count, "frame rendered");
        }
        Ok(())
    }

    fn poll_termination_requested(&mut self) -> bool {
        self.stop.poll(self.poll_wait)
    }
}

/// Sink that rasterizes annotations and writes each frame to an image file.
pub struct SnapshotSink {
    path: PathBuf,
    sequence: bool,
    written: u64,
    stop: StopSignal,
    poll_wait: Duration,
}

impl SnapshotSink {
    /// `sequence = false` overwrites `path` every frame; `true` numbers files.
    pub fn new(path: &Path, sequence: bool, stop: StopSignal, poll_wait: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            sequence,
            written: 0,
            stop,
            poll_wait,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    fn target_path(&self) -> PathBuf {
        if !self.sequence {
            return self.path.clone();
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "frame".to_string());
        let ext = self
            .path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "png".to_string());
        self.path.with_file_name(format!("{stem}_{:06}.{ext}", self.written))
    }
}

impl DisplaySink for SnapshotSink {
    fn render(&mut self, frame: &Frame, annotations: &[Annotation]) -> Result<(), DisplayError> {
        let img = rasterize(frame, annotations)?;

        let target = self.target_path();
        let format = image::ImageFormat::from_path(&target).unwrap_or(image::ImageFormat::Png);
        // write beside the target, then rename, so readers never see a partial file
        let mut staging = target.clone().into_os_string();
        staging.push(".partial");
        let staging = PathBuf::from(staging);

        img.save_with_format(&staging, format)
            .map_err(|source| DisplayError::Write {
                path: staging.clone(),
                source,
            })?;
        std::fs::rename(&staging, &target).map_err(|source| DisplayError::Rename {
            path: target.clone(),
            source,
        })?;

        self.written += 1;
        tracing::debug!(path = %target.display(), faces = ?face_count(annotations), "snapshot written");
        Ok(())
    }

    fn poll_termination_requested(&mut self) -> bool {
        self.stop.poll(self.poll_wait)
    }

    fn close(&mut self) {
        tracing::info!(frames = self.written, path = %self.path.display(), "snapshot sink closed");
    }
}
