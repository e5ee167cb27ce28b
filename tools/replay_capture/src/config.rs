use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::detector::DetectorConfig;
use crate::error::{CaptureError, Result};
use crate::keys::KeyCombo;
use crate::window::{PointFraction, RegionFraction};

pub const APP_DIR: &str = "data/replay_capture";
pub const CONFIG_FILE: &str = "config.json";
pub const MATCH_COUNT: usize = 5;

const MIN_WAIT_SECS: u64 = 30;
const MAX_WAIT_SECS: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    FrameGrabber,
    EncoderProcess,
    ExternalHotkey,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FrameGrabber => "frame_grabber",
            Self::EncoderProcess => "encoder_process",
            Self::ExternalHotkey => "external_hotkey",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "frame_grabber" | "grabber" => Ok(Self::FrameGrabber),
            "encoder_process" | "encoder" | "ffmpeg" => Ok(Self::EncoderProcess),
            "external_hotkey" | "hotkey" | "obs" => Ok(Self::ExternalHotkey),
            other => Err(CaptureError::invalid(format!("unknown backend {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub playback_load_ms: u64,
    pub result_animation_ms: u64,
    pub stats_view_ms: u64,
    pub exit_first_ms: u64,
    pub exit_second_ms: u64,
    pub between_matches_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            playback_load_ms: 2000,
            result_animation_ms: 2500,
            stats_view_ms: 2000,
            exit_first_ms: 1000,
            exit_second_ms: 500,
            between_matches_ms: 1000,
        }
    }
}

impl Timings {
    #[must_use]
    pub fn playback_load(&self) -> Duration {
        Duration::from_millis(self.playback_load_ms)
    }

    #[must_use]
    pub fn result_animation(&self) -> Duration {
        Duration::from_millis(self.result_animation_ms)
    }

    #[must_use]
    pub fn stats_view(&self) -> Duration {
        Duration::from_millis(self.stats_view_ms)
    }

    #[must_use]
    pub fn exit_first(&self) -> Duration {
        Duration::from_millis(self.exit_first_ms)
    }

    #[must_use]
    pub fn exit_second(&self) -> Duration {
        Duration::from_millis(self.exit_second_ms)
    }

    #[must_use]
    pub fn between_matches(&self) -> Duration {
        Duration::from_millis(self.between_matches_ms)
    }
}

/// Click targets and capture regions, measured on the replay list screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub play_buttons: Vec<PointFraction>,
    pub stats_button: PointFraction,
    pub exit_point: PointFraction,
    pub lineup_left: RegionFraction,
    pub lineup_right: RegionFraction,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            play_buttons: vec![
                PointFraction::new(0.6057, 0.5850),
                PointFraction::new(0.6057, 0.6247),
                PointFraction::new(0.6057, 0.6652),
                PointFraction::new(0.6057, 0.7064),
                PointFraction::new(0.6057, 0.7462),
            ],
            stats_button: PointFraction::new(0.6284, 0.9465),
            exit_point: PointFraction::new(0.8428, 0.5401),
            lineup_left: RegionFraction::new(0.05, 0.15, 0.48, 0.85),
            lineup_right: RegionFraction::new(0.52, 0.15, 0.95, 0.85),
        }
    }
}

impl Layout {
    /// Play button for a 1-based match index.
    #[must_use]
    pub fn play_button(&self, index: usize) -> Option<PointFraction> {
        index
            .checked_sub(1)
            .and_then(|slot| self.play_buttons.get(slot))
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg: String,
    pub input_format: String,
    pub audio_device: Option<String>,
    pub audio_format: String,
    pub codec: String,
    pub preset: String,
    pub startup_probe_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            input_format: "gdigrab".to_string(),
            audio_device: None,
            audio_format: "dshow".to_string(),
            codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            startup_probe_ms: 1000,
            stop_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeyConfig {
    pub start_keys: String,
    pub stop_keys: String,
    pub source_dir: Option<String>,
    pub freshness_secs: u64,
    /// The recorder's file is picked up once its size holds for
    /// `settle_checks` polls spaced `settle_interval_ms` apart.
    pub settle_interval_ms: u64,
    pub settle_checks: u32,
    pub settle_timeout_secs: u64,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            start_keys: "alt+f9".to_string(),
            stop_keys: "alt+f9".to_string(),
            source_dir: None,
            freshness_secs: 60,
            settle_interval_ms: 500,
            settle_checks: 2,
            settle_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub target_dir: Option<String>,
    pub season: String,
    pub stage: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            target_dir: None,
            season: "1".to_string(),
            stage: "Final".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    pub enabled: bool,
    pub ffprobe: String,
    pub still_secs: u64,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ffprobe: "ffprobe".to_string(),
            still_secs: 2,
        }
    }
}

/// Optional re-detection after the two exit clicks. Off by default so the
/// plain two-click timing is what runs unless asked otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitCheckConfig {
    pub enabled: bool,
    pub retries: u32,
}

impl Default for ExitCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retries: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub window_title: String,
    pub output_dir: String,
    pub temp_dir: String,
    pub backend: BackendKind,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub matches: [bool; MATCH_COUNT],
    pub max_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub timings: Timings,
    pub detector: DetectorConfig,
    pub layout: Layout,
    pub encoder: EncoderConfig,
    pub hotkey: HotkeyConfig,
    pub archive: ArchiveConfig,
    pub postprocess: PostProcessConfig,
    pub exit_check: ExitCheckConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            window_title: "NIKKE".to_string(),
            output_dir: format!("{APP_DIR}/recordings"),
            temp_dir: format!("{APP_DIR}/tmp"),
            backend: BackendKind::FrameGrabber,
            fps: 20,
            width: 1920,
            height: 1080,
            matches: [true; MATCH_COUNT],
            max_wait_secs: 300,
            poll_interval_ms: 1000,
            timings: Timings::default(),
            detector: DetectorConfig::default(),
            layout: Layout::default(),
            encoder: EncoderConfig::default(),
            hotkey: HotkeyConfig::default(),
            archive: ArchiveConfig::default(),
            postprocess: PostProcessConfig::default(),
            exit_check: ExitCheckConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// 1-based indices of the selected matches, ascending.
    #[must_use]
    pub fn selected_matches(&self) -> Vec<usize> {
        self.matches
            .iter()
            .enumerate()
            .filter(|(_, selected)| **selected)
            .map(|(slot, _)| slot + 1)
            .collect()
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        PathBuf::from(&self.temp_dir)
    }

    pub fn start_combo(&self) -> Result<KeyCombo> {
        KeyCombo::parse(&self.hotkey.start_keys)
    }

    pub fn stop_combo(&self) -> Result<KeyCombo> {
        KeyCombo::parse(&self.hotkey.stop_keys)
    }

    /// Rejects configurations that cannot drive a batch at all.
    pub fn validate(&self) -> Result<()> {
        if self.selected_matches().is_empty() {
            return Err(CaptureError::invalid("no matches selected"));
        }
        let regions = [
            ("detector.banner_region", self.detector.banner_region),
            ("detector.icon_region", self.detector.icon_region),
            ("layout.lineup_left", self.layout.lineup_left),
            ("layout.lineup_right", self.layout.lineup_right),
        ];
        for (name, region) in regions {
            if !region.is_valid() {
                return Err(CaptureError::invalid(format!("{name} is not a valid region")));
            }
        }
        for index in self.selected_matches() {
            if self.layout.play_button(index).is_none() {
                return Err(CaptureError::invalid(format!(
                    "no play button configured for match {index}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.detector.signature_ratio) {
            return Err(CaptureError::invalid("detector.signature_ratio must be in [0, 1)"));
        }
        if self.backend == BackendKind::ExternalHotkey {
            self.start_combo()?;
            self.stop_combo()?;
            if self.hotkey.source_dir.is_none() {
                return Err(CaptureError::invalid(
                    "hotkey.source_dir is required for the external_hotkey backend",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub backend: Option<BackendKind>,
    pub matches: Option<Vec<usize>>,
    pub fps: Option<u32>,
    pub max_wait_secs: Option<u64>,
    pub postprocess: Option<bool>,
}

#[must_use]
pub fn default_config_path() -> PathBuf {
    Path::new(APP_DIR).join(CONFIG_FILE)
}

pub fn load_config(overrides: &CliOverrides) -> Result<ReplayConfig> {
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(default_config_path);
    let mut config = load_or_create_config(&config_path)?;
    apply_overrides(&mut config, overrides)?;
    let config = normalize_config(config);
    debug!(path = %config_path.display(), backend = config.backend.as_str(), "config loaded");
    Ok(config)
}

pub fn load_or_create_config(path: &Path) -> Result<ReplayConfig> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let user_value: Value = serde_json::from_str(&contents)?;
        return refresh_config_defaults(&user_value);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let config = ReplayConfig::default();
    fs::write(path, serde_json::to_string_pretty(&config)?)?;
    info!(path = %path.display(), "wrote default config");
    Ok(config)
}

/// Fields missing from the user's file fall back to defaults, nested objects
/// included.
pub fn refresh_config_defaults(user_value: &Value) -> Result<ReplayConfig> {
    let mut merged = serde_json::to_value(ReplayConfig::default())?;
    merge_config_value(&mut merged, user_value);
    Ok(serde_json::from_value(merged)?)
}

fn merge_config_value(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) => merge_config_value(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target_value, source_value) => {
            *target_value = source_value.clone();
        }
    }
}

pub fn apply_overrides(config: &mut ReplayConfig, overrides: &CliOverrides) -> Result<()> {
    if let Some(backend) = overrides.backend {
        config.backend = backend;
    }
    if let Some(matches) = overrides.matches.as_ref() {
        let mut selected = [false; MATCH_COUNT];
        for index in matches {
            if !(1..=MATCH_COUNT).contains(index) {
                return Err(CaptureError::invalid(format!(
                    "match {index} is out of range 1..={MATCH_COUNT}"
                )));
            }
            selected[index - 1] = true;
        }
        config.matches = selected;
    }
    if let Some(fps) = overrides.fps {
        config.fps = fps;
    }
    if let Some(max_wait_secs) = overrides.max_wait_secs {
        config.max_wait_secs = max_wait_secs;
    }
    if let Some(enabled) = overrides.postprocess {
        config.postprocess.enabled = enabled;
    }
    Ok(())
}

fn blank_to_none(value: &mut Option<String>) {
    if value.as_ref().is_some_and(|v| v.trim().is_empty()) {
        *value = None;
    }
}

pub fn normalize_config(mut config: ReplayConfig) -> ReplayConfig {
    config.fps = config.fps.clamp(1, 60);
    // libx264 with yuv420p needs even dimensions.
    config.width = (config.width.max(2) / 2) * 2;
    config.height = (config.height.max(2) / 2) * 2;
    config.max_wait_secs = config.max_wait_secs.clamp(MIN_WAIT_SECS, MAX_WAIT_SECS);
    config.poll_interval_ms = config.poll_interval_ms.max(100);
    config.encoder.stop_timeout_ms = config.encoder.stop_timeout_ms.max(500);
    config.hotkey.freshness_secs = config.hotkey.freshness_secs.max(1);
    config.hotkey.settle_interval_ms = config.hotkey.settle_interval_ms.max(50);
    config.hotkey.settle_checks = config.hotkey.settle_checks.max(1);
    config.hotkey.settle_timeout_secs = config.hotkey.settle_timeout_secs.max(1);
    config.postprocess.still_secs = config.postprocess.still_secs.max(1);
    config.window_title = config.window_title.trim().to_string();
    blank_to_none(&mut config.encoder.audio_device);
    blank_to_none(&mut config.hotkey.source_dir);
    blank_to_none(&mut config.archive.target_dir);
    config
}
