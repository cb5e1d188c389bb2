//! Detector interface and the neighbor-vote grouping shared by backends.
//!
//! A detector turns a normalized grayscale image into raw candidate
//! rectangles. Backends produce many overlapping raw hits per face; those
//! hits are clustered here and a cluster only becomes a candidate once
//! enough neighbors vote for it.

use crate::types::{CandidateSet, Rect};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const DEFAULT_SCALE_STEP: f64 = 1.05;
pub const DEFAULT_MIN_NEIGHBOR_VOTES: u32 = 8;
pub const DEFAULT_MIN_BOX_SIDE: u32 = 40;
pub const DEFAULT_MAX_BOX_SIDE: u32 = 300;
/// Relative edge tolerance for two raw hits to count as the same face.
pub const GROUPING_EPS: f64 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid detection config: {0}")]
    InvalidConfig(String),
    #[error("image buffer too short: expected {expected}, got {actual}")]
    InvalidImage { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-call detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Ratio between successive scan scales (> 1.0).
    pub scale_step: f64,
    /// A face needs more than this many overlapping raw hits to be reported.
    pub min_neighbor_votes: u32,
    /// Smallest reported box side in pixels.
    pub min_box_side: u32,
    /// Largest reported box side in pixels.
    pub max_box_side: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scale_step: DEFAULT_SCALE_STEP,
            min_neighbor_votes: DEFAULT_MIN_NEIGHBOR_VOTES,
            min_box_side: DEFAULT_MIN_BOX_SIDE,
            max_box_side: DEFAULT_MAX_BOX_SIDE,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_step > 1.0) {
            return Err(DetectorError::InvalidConfig(format!(
                "scale_step must be > 1.0, got {}",
                self.scale_step
            )));
        }
        if self.min_box_side > self.max_box_side {
            return Err(DetectorError::InvalidConfig(format!(
                "min_box_side {} exceeds max_box_side {}",
                self.min_box_side, self.max_box_side
            )));
        }
        Ok(())
    }

    /// True when both sides of `rect` lie within the configured bounds.
    pub fn admits(&self, rect: &Rect) -> bool {
        let min = self.min_box_side as i64;
        let max = self.max_box_side as i64;
        let (w, h) = (rect.width as i64, rect.height as i64);
        w >= min && w <= max && h >= min && h <= max
    }
}

/// Borrowed single-channel 8-bit image.
#[derive(Debug, Clone, Copy)]
pub struct GrayView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> GrayView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Result<Self, DetectorError> {
        let expected = width as usize * height as usize;
        if data.len() < expected {
            return Err(DetectorError::InvalidImage {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }
}

/// A face-candidate detector.
///
/// Implementations must not carry results between calls: the same image and
/// config yield the same candidates. `&mut self` is only for scratch state
/// such as an inference session.
pub trait Detector: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Detect raw face candidates, in the backend's scan order.
    fn detect(
        &mut self,
        image: &GrayView<'_>,
        config: &DetectionConfig,
    ) -> Result<CandidateSet, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn detect(
        &mut self,
        image: &GrayView<'_>,
        config: &DetectionConfig,
    ) -> Result<CandidateSet, DetectorError> {
        (**self).detect(image, config)
    }
}

/// A raw hit before grouping, in floating-point pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawHit {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RawHit {
    fn is_similar(&self, other: &RawHit, eps: f64) -> bool {
        let delta = eps
            * (self.width.min(other.width) as f64 + self.height.min(other.height) as f64)
            * 0.5;
        let close = |a: f32, b: f32| ((a - b) as f64).abs() <= delta;
        close(self.x, other.x)
            && close(self.y, other.y)
            && close(self.x + self.width, other.x + other.width)
            && close(self.y + self.height, other.y + other.height)
    }
}

/// Cluster raw hits and keep clusters with enough neighbor votes.
///
/// Clusters are the connected components of the "similar" relation. A
/// cluster of `n` hits survives when `n > min_neighbor_votes`; its candidate
/// is the mean rectangle of its members. Output follows the scan order of
/// each cluster's first hit, and boxes outside the configured side bounds
/// are dropped.
pub fn group_candidates(hits: &[RawHit], config: &DetectionConfig) -> CandidateSet {
    let n = hits.len();
    let mut label: Vec<usize> = (0..n).collect();

    fn find(label: &mut [usize], mut i: usize) -> usize {
        while label[i] != i {
            label[i] = label[label[i]];
            i = label[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if hits[i].is_similar(&hits[j], GROUPING_EPS) {
                let (ri, rj) = (find(&mut label, i), find(&mut label, j));
                if ri != rj {
                    // keep the smaller index as root so roots follow scan order
                    let (lo, hi) = if ri < rj { (ri, rj) } else { (rj, ri) };
                    label[hi] = lo;
                }
            }
        }
    }

    // root index -> (count, sum x, sum y, sum w, sum h)
    let mut sums: Vec<Option<(u32, f64, f64, f64, f64)>> = vec![None; n];
    for (i, hit) in hits.iter().enumerate() {
        let root = find(&mut label, i);
        let entry = sums[root].get_or_insert((0, 0.0, 0.0, 0.0, 0.0));
        entry.0 += 1;
        entry.1 += hit.x as f64;
        entry.2 += hit.y as f64;
        entry.3 += hit.width as f64;
        entry.4 += hit.height as f64;
    }

    sums.into_iter()
        .flatten()
        .filter(|(count, ..)| *count > config.min_neighbor_votes)
        .map(|(count, sx, sy, sw, sh)| {
            let c = count as f64;
            Rect::new(
                (sx / c).round() as i32,
                (sy / c).round() as i32,
                (sw / c).round() as i32,
                (sh / c).round() as i32,
            )
        })
        .filter(|rect| config.admits(rect))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(x: f32, y: f32, w: f32, h: f32) -> RawHit {
        RawHit { x, y, width: w, height: h }
    }

    fn votes(n: u32) -> DetectionConfig {
        DetectionConfig {
            min_neighbor_votes: n,
            ..DetectionConfig::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let c = DetectionConfig::default();
        assert_eq!(c.scale_step, 1.05);
        assert_eq!(c.min_neighbor_votes, 8);
        assert_eq!(c.min_box_side, 40);
        assert_eq!(c.max_box_side, 300);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let c = DetectionConfig { scale_step: 1.0, ..DetectionConfig::default() };
        assert!(c.validate().is_err());
        let c = DetectionConfig { min_box_side: 400, ..DetectionConfig::default() };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_admits_bounds_inclusive() {
        let c = DetectionConfig::default();
        assert!(c.admits(&Rect::new(0, 0, 40, 40)));
        assert!(c.admits(&Rect::new(0, 0, 300, 300)));
        assert!(!c.admits(&Rect::new(0, 0, 39, 40)));
        assert!(!c.admits(&Rect::new(0, 0, 301, 200)));
    }

    #[test]
    fn test_gray_view_checks_length() {
        assert!(GrayView::new(&[0u8; 4], 2, 2).is_ok());
        assert!(GrayView::new(&[0u8; 3], 2, 2).is_err());
    }

    #[test]
    fn test_cluster_needs_more_than_min_votes() {
        let hits: Vec<RawHit> = (0..3).map(|i| hit(100.0 + i as f32, 100.0, 60.0, 60.0)).collect();
        assert!(group_candidates(&hits, &votes(3)).is_empty());
        assert_eq!(group_candidates(&hits, &votes(2)), vec![Rect::new(101, 100, 60, 60)]);
    }

    #[test]
    fn test_separate_faces_form_separate_clusters() {
        let mut hits = Vec::new();
        for i in 0..4 {
            hits.push(hit(10.0 + i as f32, 10.0, 50.0, 50.0));
            hits.push(hit(300.0, 200.0 + i as f32, 80.0, 80.0));
        }
        let out = group_candidates(&hits, &votes(2));
        assert_eq!(out.len(), 2);
        // scan order of the first member of each cluster
        assert_eq!(out[0].x, 12);
        assert_eq!(out[1].x, 300);
    }

    #[test]
    fn test_grouped_box_outside_size_bounds_dropped() {
        let hits: Vec<RawHit> = (0..5).map(|_| hit(0.0, 0.0, 20.0, 20.0)).collect();
        assert!(group_candidates(&hits, &votes(1)).is_empty());
    }

    #[test]
    fn test_empty_hits() {
        assert!(group_candidates(&[], &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn test_boxed_detector_delegates() {
        struct Fixed;
        impl Detector for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            fn detect(
                &mut self,
                _image: &GrayView<'_>,
                _config: &DetectionConfig,
            ) -> Result<CandidateSet, DetectorError> {
                Ok(vec![Rect::new(1, 2, 3, 4)])
            }
        }

        let mut boxed: Box<dyn Detector> = Box::new(Fixed);
        let data = [0u8; 4];
        let view = GrayView::new(&data, 2, 2).unwrap();
        assert_eq!(boxed.name(), "fixed");
        assert_eq!(
            boxed.detect(&view, &DetectionConfig::default()).unwrap(),
            vec![Rect::new(1, 2, 3, 4)]
        );
    }
}
