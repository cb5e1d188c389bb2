use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in image pixel space (origin top-left).
///
/// Valid detector output always has `width > 0` and `height > 0`; the type
/// itself does not enforce this so that malformed input can reach the fuser
/// and be reported instead of silently clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Raw candidates produced by one detector for one frame, in scan order.
pub type CandidateSet = Vec<Rect>;

/// Accepted, deduplicated faces for one frame, in acceptance order.
pub type FusedResult = Vec<Rect>;

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Area in pixels. Computed in `i64` so extreme coordinates cannot overflow.
    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    /// `width / height`, or `None` for a zero-height rectangle.
    pub fn aspect_ratio(&self) -> Option<f64> {
        if self.height == 0 {
            None
        } else {
            Some(self.width as f64 / self.height as f64)
        }
    }

    /// Area of the overlap with `other`; 0 when the rectangles are disjoint.
    pub fn intersection_area(&self, other: &Rect) -> i64 {
        let x1 = (self.x as i64).max(other.x as i64);
        let y1 = (self.y as i64).max(other.y as i64);
        let x2 = (self.x as i64 + self.width as i64).min(other.x as i64 + other.width as i64);
        let y2 = (self.y as i64 + self.height as i64).min(other.y as i64 + other.height as i64);

        let overlap_w = (x2 - x1).max(0);
        let overlap_h = (y2 - y1).max(0);
        overlap_w * overlap_h
    }

    /// True when either side is negative.
    pub fn is_malformed(&self) -> bool {
        self.width < 0 || self.height < 0
    }
}

impl From<(i32, i32, i32, i32)> for Rect {
    fn from((x, y, width, height): (i32, i32, i32, i32)) -> Self {
        Self { x, y, width, height }
    }
}
