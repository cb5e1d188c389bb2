//! facecount-core: Detection fusion for the live face counter.
//!
//! Merges the candidates of two independent face detectors into one
//! deduplicated set of face boxes, and defines the detector interface with
//! an SCRFD backend running via ONNX Runtime.

pub mod detector;
pub mod fusion;
pub mod scrfd;
pub mod types;

pub use detector::{DetectionConfig, Detector, DetectorError, GrayView};
pub use fusion::{fuse, CandidateFuser, CandidateSource, FusionError, FusionPolicy, Precedence};
pub use scrfd::{ScrfdDetector, ScrfdOptions};
pub use types::{CandidateSet, FusedResult, Rect};
