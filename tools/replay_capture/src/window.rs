//! Window-relative geometry and the window/input collaborator.
//!
//! Every coordinate the orchestrator uses is a fraction (0.0..=1.0) of the
//! target window's client area, so layouts measured at one resolution keep
//! working at another.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::keys::KeyCombo;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointFraction {
    pub x: f64,
    pub y: f64,
}

impl PointFraction {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Rectangle as `left, top, right, bottom` fractions of the client area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionFraction {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl RegionFraction {
    #[must_use]
    pub const fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        in_range(self.left)
            && in_range(self.top)
            && in_range(self.right)
            && in_range(self.bottom)
            && self.left < self.right
            && self.top < self.bottom
    }
}

/// Absolute screen rectangle in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScreenRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScreenRect {
    #[must_use]
    pub fn point(&self, point: PointFraction) -> (i32, i32) {
        let x = self.x + (f64::from(self.width) * point.x).round() as i32;
        let y = self.y + (f64::from(self.height) * point.y).round() as i32;
        (x, y)
    }

    #[must_use]
    pub fn region(&self, region: RegionFraction) -> ScreenRect {
        let (left, top) = self.point(PointFraction::new(region.left, region.top));
        let (right, bottom) = self.point(PointFraction::new(region.right, region.bottom));
        ScreenRect {
            x: left,
            y: top,
            width: (right - left).max(1) as u32,
            height: (bottom - top).max(1) as u32,
        }
    }
}

/// The target application window plus the input and screenshot primitives
/// needed to drive it.
pub trait WindowControl: Send + Sync {
    /// Bring the window to the foreground.
    fn activate(&self) -> bool;

    fn click_relative(&self, point: PointFraction) -> bool;

    fn hotkey(&self, combo: &KeyCombo) -> bool;

    /// Save a PNG of `region` to `dest`.
    fn screenshot(&self, region: RegionFraction, dest: &Path) -> bool;

    /// Client area in screen coordinates, if the window still exists.
    fn client_rect(&self) -> Option<ScreenRect>;
}
