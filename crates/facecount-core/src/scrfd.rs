//! SCRFD face detector backend via ONNX Runtime.
//!
//! Runs the SCRFD model over a small scale pyramid, decodes every anchor
//! above the confidence threshold into a raw hit, then hands all hits to
//! neighbor-vote grouping. No NMS is applied here; duplicate suppression
//! across detectors belongs to the fuser.

use crate::detector::{group_candidates, DetectionConfig, Detector, DetectorError, GrayView, RawHit};
use crate::types::CandidateSet;
use ndarray::{s, Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_PYRAMID_LEVELS: u32 = 2;

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    /// Map a point in network-input space back to frame pixels.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// Backend tuning that is fixed for the lifetime of a detector instance.
#[derive(Debug, Clone, Copy)]
pub struct ScrfdOptions {
    /// Raw anchor hits at or below this score are discarded.
    pub confidence_threshold: f32,
    /// Number of scales evaluated per frame, each `1 / scale_step` smaller.
    pub pyramid_levels: u32,
}

impl Default for ScrfdOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            pyramid_levels: DEFAULT_PYRAMID_LEVELS,
        }
    }
}

/// SCRFD-based face candidate detector.
pub struct ScrfdDetector {
    name: String,
    session: Session,
    options: ScrfdOptions,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load an SCRFD ONNX model from the given path.
    pub fn load(name: &str, model_path: &Path, options: ScrfdOptions) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            detector = name,
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // score + bbox per stride; keypoint outputs, when present, are ignored
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(detector = name, ?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            name: name.to_string(),
            session,
            options,
            stride_indices,
        })
    }

    /// Evaluate one pyramid level and append its raw hits.
    fn run_level(
        &mut self,
        image: &GrayView<'_>,
        shrink: f32,
        hits: &mut Vec<RawHit>,
    ) -> Result<(), DetectorError> {
        let (input, letterbox) = preprocess(image, shrink);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            decode_stride(
                scores,
                bboxes,
                stride,
                &letterbox,
                self.options.confidence_threshold,
                hits,
            );
        }
        Ok(())
    }
}

impl Detector for ScrfdDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(
        &mut self,
        image: &GrayView<'_>,
        config: &DetectionConfig,
    ) -> Result<CandidateSet, DetectorError> {
        config.validate()?;
        if image.width == 0 || image.height == 0 {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        let mut shrink = 1.0f32;
        for _ in 0..self.options.pyramid_levels.max(1) {
            self.run_level(image, shrink, &mut hits)?;
            shrink /= config.scale_step as f32;
        }

        let candidates = group_candidates(&hits, config);
        tracing::debug!(
            detector = %self.name,
            raw_hits = hits.len(),
            candidates = candidates.len(),
            "detection complete"
        );
        Ok(candidates)
    }
}

/// Letterbox the frame into the network input, additionally shrunk by
/// `shrink` (1.0 = fit exactly), and normalize to a NCHW float tensor.
fn preprocess(image: &GrayView<'_>, shrink: f32) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (image.width as usize, image.height as usize);
    let fit = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
    let scale = fit * shrink;

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

    // zero is the normalized value of the mean-gray padding
    let mut plane = Array2::<f32>::zeros((SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let resized = resize_bilinear(image.data, width, height, new_w, new_h);
    for (row, src) in resized.chunks_exact(new_w).enumerate() {
        for (col, &p) in src.iter().enumerate() {
            plane[[pad_y + row, pad_x + col]] = (p as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    // the model expects three channels; gray goes into all of them
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for channel in 0..3 {
        tensor.slice_mut(s![0, channel, .., ..]).assign(&plane);
    }

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (tensor, letterbox)
}

/// Source indices and blend weight for one output coordinate.
#[derive(Debug, Clone, Copy)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f32,
}

/// Pixel-center aligned sampling positions for resizing `src` samples to `dst`.
fn taps(src: usize, dst: usize) -> Vec<Tap> {
    let ratio = src as f32 / dst as f32;
    (0..dst)
        .map(|i| {
            let pos = ((i as f32 + 0.5) * ratio - 0.5).max(0.0);
            let lo = (pos.floor() as usize).min(src - 1);
            Tap {
                lo,
                hi: (lo + 1).min(src - 1),
                frac: (pos - lo as f32).clamp(0.0, 1.0),
            }
        })
        .collect()
}

/// Bilinear resize of a grayscale buffer.
fn resize_bilinear(frame: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let cols = taps(width, new_w);
    let rows = taps(height, new_h);
    let at = |x: usize, y: usize| frame[y * width + x] as f32;

    let mut resized = Vec::with_capacity(new_w * new_h);
    for r in &rows {
        for c in &cols {
            let top = at(c.lo, r.lo) + (at(c.hi, r.lo) - at(c.lo, r.lo)) * c.frac;
            let bottom = at(c.lo, r.hi) + (at(c.hi, r.hi) - at(c.lo, r.hi)) * c.frac;
            let val = top + (bottom - top) * r.frac;
            resized.push(val.round().clamp(0.0, 255.0) as u8);
        }
    }
    resized
}

/// Discover score/bbox tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) map directly to stride slots.
/// Anything else falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => named[slot] = (score, bbox),
            _ => {
                tracing::info!(
                    ?names,
                    "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
                );
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Decode raw hits for a single stride level, in anchor scan order.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
    hits: &mut Vec<RawHit>,
) {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * stride as f32;
        let anchor_cy = (anchor_idx / grid_w) as f32 * stride as f32;

        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[bbox_off] * stride as f32;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * stride as f32;

        let (left, top) = letterbox.unmap(x1, y1);
        let (right, bottom) = letterbox.unmap(x2, y2);
        if right <= left || bottom <= top {
            continue;
        }

        hits.push(RawHit {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
        });
    }
}
