//! Candidate fusion: merges two detectors' raw rectangles into one
//! deduplicated set of plausible face boxes.
//!
//! The pass is greedy and order-dependent. Candidates are visited in
//! precedence order and each one is compared only against rectangles that
//! were already accepted, so the earlier-listed candidate always wins a
//! conflict (first writer wins).

use crate::types::{FusedResult, Rect};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const DEFAULT_MIN_ASPECT: f64 = 0.7;
pub const DEFAULT_MAX_ASPECT: f64 = 1.4;
pub const DEFAULT_OVERLAP_FRACTION: f64 = 0.3;

/// Which detector a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Primary,
    Secondary,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FusionError {
    /// `index` is the position within the `set` detector's own candidates.
    #[error("invalid {set:?} candidate #{index}: {rect:?} has a negative side")]
    InvalidCandidate {
        set: CandidateSource,
        index: usize,
        rect: Rect,
    },
}

/// Which detector's candidates are visited first, and therefore win overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    #[default]
    PrimaryFirst,
    SecondaryFirst,
}

/// Shape and overlap rules applied during fusion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionPolicy {
    /// Inclusive lower bound on `width / height`.
    pub min_aspect: f64,
    /// Inclusive upper bound on `width / height`.
    pub max_aspect: f64,
    /// A candidate is a duplicate when its overlap with an accepted box is
    /// strictly greater than this fraction of the candidate's own area.
    pub overlap_fraction: f64,
    pub precedence: Precedence,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self {
            min_aspect: DEFAULT_MIN_ASPECT,
            max_aspect: DEFAULT_MAX_ASPECT,
            overlap_fraction: DEFAULT_OVERLAP_FRACTION,
            precedence: Precedence::PrimaryFirst,
        }
    }
}

/// Why a candidate did not make it into the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Zero height, or aspect ratio outside the policy bounds.
    Shape,
    /// Overlaps the accepted rectangle at this result index too much.
    Duplicate { of: usize },
}

/// Per-call counters, useful for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub considered: usize,
    pub rejected_shape: usize,
    pub rejected_duplicate: usize,
}

/// Stateless fuser parameterised by a [`FusionPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateFuser {
    policy: FusionPolicy,
}

impl CandidateFuser {
    pub fn new(policy: FusionPolicy) -> Self {
        Self { policy }
    }

    /// Fuse two candidate sets into one deduplicated result.
    ///
    /// Fails with [`FusionError::InvalidCandidate`] before producing any
    /// output if either set contains a rectangle with a negative side. An
    /// empty result is a valid outcome, not an error.
    pub fn fuse(&self, primary: &[Rect], secondary: &[Rect]) -> Result<FusedResult, FusionError> {
        self.fuse_with_stats(primary, secondary).map(|(result, _)| result)
    }

    /// Same as [`fuse`](Self::fuse), also returning rejection counters.
    pub fn fuse_with_stats(
        &self,
        primary: &[Rect],
        secondary: &[Rect],
    ) -> Result<(FusedResult, FusionStats), FusionError> {
        let (first, second) = match self.policy.precedence {
            Precedence::PrimaryFirst => (primary, secondary),
            Precedence::SecondaryFirst => (secondary, primary),
        };

        for (set, candidates) in [
            (CandidateSource::Primary, primary),
            (CandidateSource::Secondary, secondary),
        ] {
            if let Some(index) = candidates.iter().position(Rect::is_malformed) {
                return Err(FusionError::InvalidCandidate {
                    set,
                    index,
                    rect: candidates[index],
                });
            }
        }

        let mut accepted: FusedResult = Vec::with_capacity(first.len() + second.len());
        let mut stats = FusionStats::default();

        for candidate in first.iter().chain(second) {
            stats.considered += 1;
            match self.judge(candidate, &accepted) {
                None => accepted.push(*candidate),
                Some(Rejection::Shape) => {
                    stats.rejected_shape += 1;
                    tracing::trace!(?candidate, "rejected: implausible shape");
                }
                Some(Rejection::Duplicate { of }) => {
                    stats.rejected_duplicate += 1;
                    tracing::trace!(?candidate, duplicate_of = ?accepted[of], "rejected: overlap");
                }
            }
        }

        tracing::debug!(
            considered = stats.considered,
            accepted = accepted.len(),
            rejected_shape = stats.rejected_shape,
            rejected_duplicate = stats.rejected_duplicate,
            "fusion complete"
        );

        Ok((accepted, stats))
    }

    /// Decide whether `candidate` may join `accepted`. `None` means accept.
    pub fn judge(&self, candidate: &Rect, accepted: &[Rect]) -> Option<Rejection> {
        if !self.has_plausible_shape(candidate) {
            return Some(Rejection::Shape);
        }

        let limit = self.policy.overlap_fraction * candidate.area() as f64;
        accepted
            .iter()
            .position(|kept| candidate.intersection_area(kept) as f64 > limit)
            .map(|of| Rejection::Duplicate { of })
    }

    fn has_plausible_shape(&self, rect: &Rect) -> bool {
        match rect.aspect_ratio() {
            Some(ratio) => ratio >= self.policy.min_aspect && ratio <= self.policy.max_aspect,
            None => false,
        }
    }
}

/// Fuse with the default policy (primary detector first).
pub fn fuse(primary: &[Rect], secondary: &[Rect]) -> Result<FusedResult, FusionError> {
    CandidateFuser::default().fuse(primary, secondary)
}
