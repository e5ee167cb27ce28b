//! End-of-match screen classification.
//!
//! Two gates must agree before a result screen is reported:
//! 1. the banner region carries exactly one of the win/loss color signatures
//!    above `signature_ratio` of its pixels;
//! 2. the statistics-icon region shows structure, either enough bright pixels
//!    or enough Sobel edges.
//!
//! The banner colors alone also appear during transition animations, hence
//! the second gate.

use std::fs;
use std::path::PathBuf;

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::window::{RegionFraction, WindowControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRange {
    pub min: u8,
    pub max: u8,
}

impl ChannelRange {
    #[must_use]
    pub const fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    fn contains(self, value: u8) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Per-channel ranges that classify a pixel into a semantic color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSignature {
    pub red: ChannelRange,
    pub green: ChannelRange,
    pub blue: ChannelRange,
}

impl ColorSignature {
    /// Cyan banner text: the local side won.
    pub const WIN_CYAN: Self = Self {
        red: ChannelRange::new(0, 99),
        green: ChannelRange::new(181, 255),
        blue: ChannelRange::new(181, 255),
    };

    /// Red banner text: the opposing side won.
    pub const LOSS_RED: Self = Self {
        red: ChannelRange::new(201, 255),
        green: ChannelRange::new(0, 79),
        blue: ChannelRange::new(0, 79),
    };

    #[must_use]
    pub fn matches(&self, pixel: &Rgb<u8>) -> bool {
        let [r, g, b] = pixel.0;
        self.red.contains(r) && self.green.contains(g) && self.blue.contains(b)
    }

    #[must_use]
    pub fn ratio(&self, image: &RgbImage) -> f64 {
        let total = u64::from(image.width()) * u64::from(image.height());
        if total == 0 {
            return 0.0;
        }
        let hits = image.pixels().filter(|p| self.matches(p)).count() as u64;
        hits as f64 / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub banner_region: RegionFraction,
    pub icon_region: RegionFraction,
    pub win_signature: ColorSignature,
    pub loss_signature: ColorSignature,
    pub signature_ratio: f64,
    pub bright_luma: u8,
    pub bright_ratio: f64,
    pub edge_magnitude: f64,
    pub edge_ratio: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            banner_region: RegionFraction::new(0.2, 0.05, 0.6, 0.3),
            icon_region: RegionFraction::new(0.60, 0.92, 0.66, 0.98),
            win_signature: ColorSignature::WIN_CYAN,
            loss_signature: ColorSignature::LOSS_RED,
            signature_ratio: 0.01,
            bright_luma: 200,
            bright_ratio: 0.02,
            edge_magnitude: 128.0,
            edge_ratio: 0.06,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Win,
    Loss,
    Unknown,
}

/// Point-in-time classification. `verdict` is only known when `matched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionResult {
    matched: bool,
    verdict: Verdict,
}

impl DetectionResult {
    #[must_use]
    pub const fn unmatched() -> Self {
        Self {
            matched: false,
            verdict: Verdict::Unknown,
        }
    }

    #[must_use]
    pub const fn matched(verdict: Verdict) -> Self {
        Self {
            matched: true,
            verdict,
        }
    }

    #[must_use]
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.verdict
    }
}

/// Anything that can answer "is the result screen up?" for the orchestrator.
pub trait ScreenProbe: Send + Sync {
    fn detect(&self, window: &dyn WindowControl) -> DetectionResult;
}

pub struct EndScreenDetector {
    config: DetectorConfig,
    temp_dir: PathBuf,
}

impl EndScreenDetector {
    #[must_use]
    pub fn new(config: DetectorConfig, temp_dir: PathBuf) -> Self {
        Self { config, temp_dir }
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Banner stage: exactly one signature above threshold.
    #[must_use]
    pub fn classify_banner(&self, banner: &RgbImage) -> Option<Verdict> {
        let win = self.config.win_signature.ratio(banner);
        let loss = self.config.loss_signature.ratio(banner);
        let threshold = self.config.signature_ratio;
        match (win > threshold, loss > threshold) {
            (true, false) => {
                debug!(win_ratio = win, "win banner signature");
                Some(Verdict::Win)
            }
            (false, true) => {
                debug!(loss_ratio = loss, "loss banner signature");
                Some(Verdict::Loss)
            }
            (true, true) => {
                debug!(win_ratio = win, loss_ratio = loss, "ambiguous banner, ignoring");
                None
            }
            (false, false) => None,
        }
    }

    /// Icon stage: bright-pixel fraction or edge density above threshold.
    #[must_use]
    pub fn icon_corroborates(&self, icon: &RgbImage) -> bool {
        let bright = bright_ratio(icon, self.config.bright_luma);
        if bright > self.config.bright_ratio {
            debug!(bright_ratio = bright, "icon corroborated by brightness");
            return true;
        }
        let edges = edge_density(icon, self.config.edge_magnitude);
        if edges > self.config.edge_ratio {
            debug!(edge_density = edges, "icon corroborated by edges");
            return true;
        }
        false
    }

    /// Both stages on already-captured regions.
    #[must_use]
    pub fn classify(&self, banner: &RgbImage, icon: &RgbImage) -> DetectionResult {
        match self.classify_banner(banner) {
            Some(verdict) if self.icon_corroborates(icon) => DetectionResult::matched(verdict),
            _ => DetectionResult::unmatched(),
        }
    }

    fn capture_region(
        &self,
        window: &dyn WindowControl,
        region: RegionFraction,
        label: &str,
    ) -> Option<(RgbImage, TempImage)> {
        let path = self
            .temp_dir
            .join(format!("{label}_{}.png", Uuid::new_v4().simple()));
        let temp = TempImage(path);
        if !window.screenshot(region, &temp.0) {
            debug!(region = label, "screenshot failed");
            return None;
        }
        match image::open(&temp.0) {
            Ok(image) => Some((image.to_rgb8(), temp)),
            Err(err) => {
                warn!(region = label, error = %err, "could not read screenshot");
                None
            }
        }
    }
}

impl ScreenProbe for EndScreenDetector {
    fn detect(&self, window: &dyn WindowControl) -> DetectionResult {
        if let Err(err) = fs::create_dir_all(&self.temp_dir) {
            warn!(error = %err, "temp dir unavailable");
            return DetectionResult::unmatched();
        }
        let Some((banner, _banner_file)) =
            self.capture_region(window, self.config.banner_region, "banner")
        else {
            return DetectionResult::unmatched();
        };
        let Some(verdict) = self.classify_banner(&banner) else {
            return DetectionResult::unmatched();
        };
        let Some((icon, _icon_file)) =
            self.capture_region(window, self.config.icon_region, "icon")
        else {
            return DetectionResult::unmatched();
        };
        if self.icon_corroborates(&icon) {
            info!(?verdict, "result screen detected");
            DetectionResult::matched(verdict)
        } else {
            debug!(?verdict, "banner matched but icon region is blank");
            DetectionResult::unmatched()
        }
    }
}

/// Screenshot file removed on drop, whatever the classification did.
struct TempImage(PathBuf);

impl Drop for TempImage {
    fn drop(&mut self) {
        if self.0.exists() {
            let _ = fs::remove_file(&self.0);
        }
    }
}

fn luma(pixel: &Rgb<u8>) -> f64 {
    let [r, g, b] = pixel.0;
    0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b)
}

#[must_use]
pub fn bright_ratio(image: &RgbImage, threshold: u8) -> f64 {
    let total = u64::from(image.width()) * u64::from(image.height());
    if total == 0 {
        return 0.0;
    }
    let bright = image
        .pixels()
        .filter(|p| luma(p) > f64::from(threshold))
        .count() as u64;
    bright as f64 / total as f64
}

/// Fraction of interior pixels whose Sobel gradient magnitude exceeds
/// `magnitude`.
#[must_use]
pub fn edge_density(image: &RgbImage, magnitude: f64) -> f64 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let gray: Vec<f64> = image.pixels().map(luma).collect();
    let at = |x: u32, y: u32| gray[(y * width + x) as usize];

    let mut edges = 0u64;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
            if (gx * gx + gy * gy).sqrt() > magnitude {
                edges += 1;
            }
        }
    }
    let interior = u64::from(width - 2) * u64::from(height - 2);
    edges as f64 / interior as f64
}
