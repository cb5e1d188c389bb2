//! The frame loop: capture, normalize, detect twice, fuse, annotate, render,
//! poll for stop. One frame at a time; a failing frame ends the session.

use crate::config::{Config, SinkKind};
use crate::display::{annotate, DisplaySink, HeadlessSink, SnapshotSink, StopSignal};
use chrono::{DateTime, Utc};
use facecount_core::{
    CandidateFuser, CandidateSet, DetectionConfig, Detector, FusedResult, FusionPolicy, GrayView,
    ScrfdDetector, ScrfdOptions,
};
use facecount_hw::{normalize, Camera, CaptureSource, Frame, GrayImage, ImageDirSource};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Init failed: there is no degraded mode without a camera or a detector.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to acquire {what}: {source}")]
    Acquisition {
        what: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SessionError {
    fn acquisition(what: &str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Acquisition {
            what: what.to_string(),
            source: Box::new(source),
        }
    }
}

/// Step of the loop body a failure surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Capture,
    Normalize,
    Detect,
    Fuse,
    Render,
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    /// The capture source has no more frames.
    StreamEnded,
    /// The display sink reported a user stop request.
    StopRequested,
    /// `max_frames` frames were processed.
    FrameLimitReached,
    /// A frame failed; the session ended instead of skipping it.
    FrameFailure {
        iteration: u64,
        stage: Stage,
        message: String,
    },
}

/// Outcome of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub frames_processed: u64,
    pub faces_last_frame: usize,
    pub max_faces: usize,
    /// Longest time from frame capture to render completion.
    pub max_frame_latency_ms: u64,
    pub exit: ExitReason,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Fixed per-session loop parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopSettings {
    pub detection: DetectionConfig,
    pub fusion: FusionPolicy,
    pub parallel_detectors: bool,
    pub max_frames: Option<u64>,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detection: config.detection,
            fusion: config.fusion,
            parallel_detectors: config.parallel_detectors,
            max_frames: config.max_frames,
        }
    }
}

/// Everything one iteration produces; dropped when the iteration ends.
struct FrameContext {
    frame: Frame,
    gray: GrayImage,
    primary: CandidateSet,
    secondary: CandidateSet,
    fused: FusedResult,
}

/// What a completed iteration reports back to the loop.
struct FrameOutcome {
    faces: usize,
    latency: Duration,
}

struct StageError {
    stage: Stage,
    message: String,
}

impl StageError {
    fn new(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}

/// Owns the capture source, both detectors and the display sink for the
/// lifetime of a run. Released exactly once, on drop at the latest.
pub struct Session {
    capture: Box<dyn CaptureSource>,
    primary: Box<dyn Detector>,
    secondary: Box<dyn Detector>,
    sink: Box<dyn DisplaySink>,
    settings: LoopSettings,
    fuser: CandidateFuser,
    released: bool,
}

impl Session {
    /// Assemble a session from already-acquired parts.
    pub fn new(
        capture: Box<dyn CaptureSource>,
        primary: Box<dyn Detector>,
        secondary: Box<dyn Detector>,
        sink: Box<dyn DisplaySink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            capture,
            primary,
            secondary,
            sink,
            fuser: CandidateFuser::new(settings.fusion),
            settings,
            released: false,
        }
    }

    /// Acquire the capture source and both detectors described by `config`.
    ///
    /// Anything acquired before a failure is released before returning.
    pub fn open(config: &Config, stop: StopSignal) -> Result<Self, SessionError> {
        let poll_wait = Duration::from_millis(config.poll_wait_ms);
        let sink: Box<dyn DisplaySink> = match config.sink {
            SinkKind::Headless => Box::new(HeadlessSink::new(stop, poll_wait)),
            SinkKind::Snapshot => Box::new(SnapshotSink::new(
                &config.snapshot_path,
                config.snapshot_sequence,
                stop,
                poll_wait,
            )),
        };

        let mut capture: Box<dyn CaptureSource> = if config.source_is_image_dir() {
            Box::new(
                ImageDirSource::open(Path::new(&config.source))
                    .map_err(|e| SessionError::acquisition("capture source", e))?,
            )
        } else {
            Box::new(
                Camera::open(&config.source, config.capture_width, config.capture_height)
                    .map_err(|e| SessionError::acquisition("capture source", e))?,
            )
        };
        tracing::info!(source = %capture.describe(), "capture source acquired");

        let options = ScrfdOptions {
            confidence_threshold: config.confidence_threshold,
            pyramid_levels: config.pyramid_levels,
        };

        let primary = match ScrfdDetector::load("primary", &config.primary_model_path(), options) {
            Ok(d) => d,
            Err(e) => {
                capture.close();
                return Err(SessionError::acquisition("primary detector", e));
            }
        };
        let secondary =
            match ScrfdDetector::load("secondary", &config.secondary_model_path(), options) {
                Ok(d) => d,
                Err(e) => {
                    capture.close();
                    return Err(SessionError::acquisition("secondary detector", e));
                }
            };

        Ok(Self::new(
            capture,
            Box::new(primary),
            Box::new(secondary),
            sink,
            LoopSettings::from_config(config),
        ))
    }

    /// Run until the stream ends, a stop is requested, the frame limit is hit,
    /// or a frame fails. Resources are released before the summary is returned.
    pub fn run(mut self) -> SessionSummary {
        let started_at = Utc::now();
        let mut frames_processed: u64 = 0;
        let mut faces_last_frame = 0;
        let mut max_faces = 0;
        let mut max_latency = Duration::ZERO;

        tracing::info!(
            source = %self.capture.describe(),
            primary = self.primary.name(),
            secondary = self.secondary.name(),
            parallel = self.settings.parallel_detectors,
            "frame loop started"
        );

        let exit = loop {
            if self.settings.max_frames.is_some_and(|limit| frames_processed >= limit) {
                break ExitReason::FrameLimitReached;
            }

            let iteration = frames_processed;
            match self.process_frame() {
                Ok(Some(outcome)) => {
                    frames_processed += 1;
                    faces_last_frame = outcome.faces;
                    max_faces = max_faces.max(outcome.faces);
                    max_latency = max_latency.max(outcome.latency);
                }
                Ok(None) => break ExitReason::StreamEnded,
                Err(StageError { stage, message }) => {
                    tracing::error!(iteration, ?stage, error = %message, "frame failed, terminating");
                    break ExitReason::FrameFailure {
                        iteration,
                        stage,
                        message,
                    };
                }
            }

            if self.sink.poll_termination_requested() {
                break ExitReason::StopRequested;
            }
        };

        self.release();
        let ended_at = Utc::now();
        tracing::info!(frames = frames_processed, max_faces, exit = ?exit, "frame loop finished");

        SessionSummary {
            frames_processed,
            faces_last_frame,
            max_faces,
            max_frame_latency_ms: u64::try_from(max_latency.as_millis()).unwrap_or(u64::MAX),
            exit,
            started_at,
            ended_at,
        }
    }

    /// One loop iteration up to and including render. `None` means end of stream.
    fn process_frame(&mut self) -> Result<Option<FrameOutcome>, StageError> {
        let frame = match self.capture.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => return Err(StageError::new(Stage::Capture, e)),
        };

        let gray = normalize(&frame).map_err(|e| StageError::new(Stage::Normalize, e))?;
        let (primary, secondary) = {
            let view = GrayView::new(&gray.data, gray.width, gray.height)
                .map_err(|e| StageError::new(Stage::Normalize, e))?;
            self.detect_both(&view)?
        };

        let fused = self
            .fuser
            .fuse(&primary, &secondary)
            .map_err(|e| StageError::new(Stage::Fuse, e))?;

        let ctx = FrameContext {
            frame,
            gray,
            primary,
            secondary,
            fused,
        };

        let annotations = annotate(&ctx.fused);
        self.sink
            .render(&ctx.frame, &annotations)
            .map_err(|e| StageError::new(Stage::Render, e))?;
        let latency = ctx.frame.timestamp.elapsed();

        tracing::debug!(
            seq = ctx.frame.sequence,
            latency_ms = latency.as_millis() as u64,
            width = ctx.gray.width,
            height = ctx.gray.height,
            primary = ctx.primary.len(),
            secondary = ctx.secondary.len(),
            faces = ctx.fused.len(),
            "frame processed"
        );
        Ok(Some(FrameOutcome {
            faces: ctx.fused.len(),
            latency,
        }))
    }

    /// Run both detectors on the same frame, concurrently when configured.
    /// Both finish before this returns.
    fn detect_both(
        &mut self,
        view: &GrayView<'_>,
    ) -> Result<(CandidateSet, CandidateSet), StageError> {
        let config = &self.settings.detection;
        let primary = &mut self.primary;
        let secondary = &mut self.secondary;

        let (a, b) = if self.settings.parallel_detectors {
            std::thread::scope(|s| {
                let handle = s.spawn(move || run_detector(&mut **secondary, view, config));
                let a = run_detector(&mut **primary, view, config);
                let b = match handle.join() {
                    Ok(b) => b,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
                (a, b)
            })
        } else {
            (
                run_detector(&mut **primary, view, config),
                run_detector(&mut **secondary, view, config),
            )
        };
        Ok((a?, b?))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.sink.close();
        self.capture.close();
        tracing::info!("session resources released");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_detector(
    detector: &mut dyn Detector,
    view: &GrayView<'_>,
    config: &DetectionConfig,
) -> Result<CandidateSet, StageError> {
    detector
        .detect(view, config)
        .map_err(|e| StageError::new(Stage::Detect, format!("{}: {e}", detector.name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{Annotation, DisplayError};
    use facecount_core::{DetectorError, Rect};
    use facecount_hw::{CaptureError, Frame, PixelFormat};
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Counters {
        capture_closes: Arc<AtomicUsize>,
        sink_closes: Arc<AtomicUsize>,
        detector_drops: Arc<AtomicUsize>,
        rendered_counts: Arc<Mutex<Vec<usize>>>,
    }

    impl Counters {
        fn rendered(&self) -> Vec<usize> {
            self.rendered_counts.lock().unwrap().clone()
        }
    }

    struct FakeCapture {
        script: VecDeque<Result<Frame, CaptureError>>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeCapture {
        fn frames(n: usize, counters: &Counters) -> Self {
            Self {
                script: (0..n).map(|i| Ok(test_frame(i as u32))).collect(),
                closes: counters.capture_closes.clone(),
            }
        }
    }

    impl CaptureSource for FakeCapture {
        fn describe(&self) -> String {
            "fake capture".into()
        }

        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            self.script.pop_front().transpose()
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeDetector {
        name: &'static str,
        output: CandidateSet,
        fail_on_call: Option<usize>,
        panic_on_call: Option<usize>,
        delay: Duration,
        calls: usize,
        drops: Arc<AtomicUsize>,
    }

    impl FakeDetector {
        fn new(name: &'static str, output: CandidateSet, counters: &Counters) -> Self {
            Self {
                name,
                output,
                fail_on_call: None,
                panic_on_call: None,
                delay: Duration::ZERO,
                calls: 0,
                drops: counters.detector_drops.clone(),
            }
        }
    }

    impl Detector for FakeDetector {
        fn name(&self) -> &str {
            self.name
        }

        fn detect(
            &mut self,
            _image: &GrayView<'_>,
            _config: &DetectionConfig,
        ) -> Result<CandidateSet, DetectorError> {
            let call = self.calls;
            self.calls += 1;
            if self.panic_on_call == Some(call) {
                panic!("{} blew up on call {call}", self.name);
            }
            std::thread::sleep(self.delay);
            if self.fail_on_call == Some(call) {
                return Err(DetectorError::InferenceFailed("boom".into()));
            }
            Ok(self.output.clone())
        }
    }

    impl Drop for FakeDetector {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeSink {
        stop_after: Option<usize>,
        fail_render: bool,
        counters: Counters,
    }

    impl FakeSink {
        fn new(counters: &Counters) -> Self {
            Self {
                stop_after: None,
                fail_render: false,
                counters: counters.clone(),
            }
        }
    }

    impl DisplaySink for FakeSink {
        fn render(&mut self, frame: &Frame, annotations: &[Annotation]) -> Result<(), DisplayError> {
            if self.fail_render {
                return Err(DisplayError::BadFrame {
                    width: frame.width,
                    height: frame.height,
                });
            }
            let count = annotations
                .iter()
                .find_map(|a| match a {
                    Annotation::CountOverlay { count, .. } => Some(*count),
                    Annotation::FaceBox { .. } => None,
                })
                .unwrap();
            let boxes = annotations.len() - 1;
            assert_eq!(count, boxes);
            self.counters.rendered_counts.lock().unwrap().push(count);
            Ok(())
        }

        fn poll_termination_requested(&mut self) -> bool {
            self.stop_after
                .is_some_and(|n| self.counters.rendered_counts.lock().unwrap().len() >= n)
        }

        fn close(&mut self) {
            self.counters.sink_closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_frame(seq: u32) -> Frame {
        Frame::new(vec![seq as u8; 32 * 24], 32, 24, PixelFormat::Gray8, seq).unwrap()
    }

    fn faces_a() -> CandidateSet {
        vec![Rect::new(0, 0, 100, 100), Rect::new(300, 300, 80, 80)]
    }

    fn faces_b() -> CandidateSet {
        // first duplicates faces_a()[0], second is new, third has a bad shape
        vec![
            Rect::new(10, 10, 100, 100),
            Rect::new(500, 50, 60, 60),
            Rect::new(600, 0, 200, 50),
        ]
    }

    fn session(
        capture: FakeCapture,
        primary: FakeDetector,
        secondary: FakeDetector,
        sink: FakeSink,
        settings: LoopSettings,
    ) -> Session {
        Session::new(
            Box::new(capture),
            Box::new(primary),
            Box::new(secondary),
            Box::new(sink),
            settings,
        )
    }

    fn assert_released_once(counters: &Counters) {
        assert_eq!(counters.capture_closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sink_closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.detector_drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stream_end_processes_every_frame() {
        let c = Counters::default();
        let summary = session(
            FakeCapture::frames(3, &c),
            FakeDetector::new("a", faces_a(), &c),
            FakeDetector::new("b", faces_b(), &c),
            FakeSink::new(&c),
            LoopSettings::default(),
        )
        .run();

        assert_eq!(summary.exit, ExitReason::StreamEnded);
        assert_eq!(summary.frames_processed, 3);
        assert_eq!(summary.faces_last_frame, 3);
        assert_eq!(summary.max_faces, 3);
        assert_eq!(c.rendered(), vec![3, 3, 3]);
        assert!(summary.ended_at >= summary.started_at);
        assert_released_once(&c);
    }

    #[test]
    fn test_detector_failure_mid_run_terminates_and_releases() {
        let c = Counters::default();
        let mut secondary = FakeDetector::new("b", faces_b(), &c);
        secondary.fail_on_call = Some(1);

        let summary = session(
            FakeCapture::frames(5, &c),
            FakeDetector::new("a", faces_a(), &c),
            secondary,
            FakeSink::new(&c),
            LoopSettings::default(),
        )
        .run();

        match summary.exit {
            ExitReason::FrameFailure {
                iteration,
                stage,
                ref message,
            } => {
                assert_eq!(iteration, 1);
                assert_eq!(stage, Stage::Detect);
                assert!(message.starts_with("b:"), "{message}");
            }
            ref other => panic!("unexpected exit {other:?}"),
        }
        assert_eq!(summary.frames_processed, 1);
        assert_eq!(c.rendered(), vec![3]);
        assert_released_once(&c);
    }

    #[test]
    fn test_capture_error_is_capture_stage_failure() {
        let c = Counters::default();
        let mut capture = FakeCapture::frames(1, &c);
        capture
            .script
            .push_back(Err(CaptureError::CaptureFailed("unplugged".into())));

        let summary = session(
            capture,
            FakeDetector::new("a", vec![], &c),
            FakeDetector::new("b", vec![], &c),
            FakeSink::new(&c),
            LoopSettings::default(),
        )
        .run();

        assert!(matches!(
            summary.exit,
            ExitReason::FrameFailure { iteration: 1, stage: Stage::Capture, .. }
        ));
        assert_released_once(&c);
    }

    #[test]
    fn test_stop_request_ends_after_render() {
        let c = Counters::default();
        let mut sink = FakeSink::new(&c);
        sink.stop_after = Some(2);

        let summary = session(
            FakeCapture::frames(10, &c),
            FakeDetector::new("a", faces_a(), &c),
            FakeDetector::new("b", vec![], &c),
            sink,
            LoopSettings::default(),
        )
        .run();

        assert_eq!(summary.exit, ExitReason::StopRequested);
        assert_eq!(summary.frames_processed, 2);
        assert_eq!(c.rendered(), vec![2, 2]);
        assert_released_once(&c);
    }

    #[test]
    fn test_frame_limit() {
        let c = Counters::default();
        let summary = session(
            FakeCapture::frames(10, &c),
            FakeDetector::new("a", vec![], &c),
            FakeDetector::new("b", vec![], &c),
            FakeSink::new(&c),
            LoopSettings {
                max_frames: Some(4),
                ..LoopSettings::default()
            },
        )
        .run();

        assert_eq!(summary.exit, ExitReason::FrameLimitReached);
        assert_eq!(summary.frames_processed, 4);
        assert_eq!(summary.faces_last_frame, 0);
        assert_released_once(&c);
    }

    #[test]
    fn test_malformed_candidate_is_fuse_stage_failure() {
        let c = Counters::default();
        let summary = session(
            FakeCapture::frames(2, &c),
            FakeDetector::new("a", vec![Rect::new(0, 0, -5, 10)], &c),
            FakeDetector::new("b", vec![], &c),
            FakeSink::new(&c),
            LoopSettings::default(),
        )
        .run();

        assert!(matches!(
            summary.exit,
            ExitReason::FrameFailure { iteration: 0, stage: Stage::Fuse, .. }
        ));
        assert!(c.rendered().is_empty());
        assert_released_once(&c);
    }

    #[test]
    fn test_render_failure_is_render_stage_failure() {
        let c = Counters::default();
        let mut sink = FakeSink::new(&c);
        sink.fail_render = true;

        let summary = session(
            FakeCapture::frames(2, &c),
            FakeDetector::new("a", vec![], &c),
            FakeDetector::new("b", vec![], &c),
            sink,
            LoopSettings::default(),
        )
        .run();

        assert!(matches!(
            summary.exit,
            ExitReason::FrameFailure { stage: Stage::Render, .. }
        ));
        assert_released_once(&c);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let run = |parallel| {
            let c = Counters::default();
            let summary = session(
                FakeCapture::frames(4, &c),
                FakeDetector::new("a", faces_a(), &c),
                FakeDetector::new("b", faces_b(), &c),
                FakeSink::new(&c),
                LoopSettings {
                    parallel_detectors: parallel,
                    ..LoopSettings::default()
                },
            )
            .run();
            assert_released_once(&c);
            (summary.exit, summary.frames_processed, c.rendered())
        };
        assert_eq!(run(false), run(true));
    }

    #[rstest]
    #[case::sequential(false)]
    #[case::parallel(true)]
    fn test_detector_panic_still_releases_once(#[case] parallel: bool) {
        let c = Counters::default();
        let mut secondary = FakeDetector::new("b", faces_b(), &c);
        secondary.panic_on_call = Some(1);
        let s = session(
            FakeCapture::frames(5, &c),
            FakeDetector::new("a", faces_a(), &c),
            secondary,
            FakeSink::new(&c),
            LoopSettings {
                parallel_detectors: parallel,
                ..LoopSettings::default()
            },
        );

        let result = catch_unwind(AssertUnwindSafe(move || s.run()));

        assert!(result.is_err());
        assert_eq!(c.rendered(), vec![3]);
        assert_released_once(&c);
    }

    #[test]
    fn test_summary_reports_frame_latency() {
        let c = Counters::default();
        let mut primary = FakeDetector::new("a", vec![], &c);
        primary.delay = Duration::from_millis(5);
        let summary = session(
            FakeCapture::frames(2, &c),
            primary,
            FakeDetector::new("b", vec![], &c),
            FakeSink::new(&c),
            LoopSettings::default(),
        )
        .run();
        assert!(summary.max_frame_latency_ms >= 5, "{}", summary.max_frame_latency_ms);
    }

    #[test]
    fn test_drop_without_run_releases_once() {
        let c = Counters::default();
        let s = session(
            FakeCapture::frames(1, &c),
            FakeDetector::new("a", vec![], &c),
            FakeDetector::new("b", vec![], &c),
            FakeSink::new(&c),
            LoopSettings::default(),
        );
        drop(s);
        assert_released_once(&c);
    }

    #[test]
    fn test_summary_serializes_exit_kind() {
        let c = Counters::default();
        let summary = session(
            FakeCapture::frames(0, &c),
            FakeDetector::new("a", vec![], &c),
            FakeDetector::new("b", vec![], &c),
            FakeSink::new(&c),
            LoopSettings::default(),
        )
        .run();
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["exit"]["kind"], "stream_ended");
        assert_eq!(json["frames_processed"], 0);
    }

    #[test]
    fn test_open_fails_without_models() {
        let tmp = tempfile::tempdir().unwrap();
        image::RgbImage::new(8, 8).save(tmp.path().join("a.png")).unwrap();

        let config = Config {
            source: tmp.path().display().to_string(),
            model_dir: tmp.path().join("no-models"),
            ..Config::default()
        };
        let (_handle, stop) = crate::display::stop_channel();
        let err = Session::open(&config, stop).err().unwrap();
        assert!(matches!(err, SessionError::Acquisition { ref what, .. } if what == "primary detector"));
    }

    #[test]
    fn test_open_fails_without_capture_source() {
        let config = Config {
            source: "/nonexistent/video9".into(),
            ..Config::default()
        };
        let (_handle, stop) = crate::display::stop_channel();
        let err = Session::open(&config, stop).err().unwrap();
        assert!(matches!(err, SessionError::Acquisition { ref what, .. } if what == "capture source"));
    }
}
