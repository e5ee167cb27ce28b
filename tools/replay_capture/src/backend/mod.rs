//! Recording backends. One interface, three strategies picked from config:
//! an in-process frame grabber, an external encoder process, or hotkeys sent
//! to a recorder that is already running.

pub mod encoder;
pub mod frame_grabber;
pub mod hotkey;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{BackendKind, ReplayConfig};
use crate::error::Result;
use crate::window::{ScreenRect, WindowControl};

/// What to record. Fixed for the lifetime of one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub output_path: PathBuf,
    pub backend_kind: BackendKind,
    pub window_title: String,
    /// Client area of the target window, when known.
    pub region: Option<ScreenRect>,
}

impl CaptureConfig {
    #[must_use]
    pub fn from_config(config: &ReplayConfig, output_path: PathBuf, region: Option<ScreenRect>) -> Self {
        Self {
            fps: config.fps,
            width: config.width,
            height: config.height,
            output_path,
            backend_kind: config.backend,
            window_title: config.window_title.clone(),
            region,
        }
    }
}

/// Token for one recording. Only the backend that issued it acts on it.
#[derive(Debug)]
pub struct RecordingHandle {
    id: Uuid,
    output: PathBuf,
    stopped: bool,
}

impl RecordingHandle {
    #[must_use]
    pub fn new(output: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            output,
            stopped: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn output(&self) -> &Path {
        &self.output
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Returns `true` only the first time, so callers release once.
    pub fn mark_stopped(&mut self) -> bool {
        !std::mem::replace(&mut self.stopped, true)
    }
}

pub trait CaptureBackend: Send {
    fn kind(&self) -> BackendKind;

    fn start(&mut self, target: &CaptureConfig) -> Result<RecordingHandle>;

    /// Idempotent. A handle that is already stopped, or that this backend
    /// never started, is a no-op.
    fn stop(&mut self, handle: &mut RecordingHandle) -> Result<()>;

    /// Most recent artifact produced outside this process, if the backend
    /// has that notion.
    fn locate_latest_artifact(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Path of the finished recording for a stopped handle.
    fn finish_artifact(&mut self, handle: &RecordingHandle) -> Result<Option<PathBuf>> {
        let output = handle.output();
        if output.exists() {
            Ok(Some(output.to_path_buf()))
        } else {
            debug!(path = %output.display(), "no artifact written");
            Ok(None)
        }
    }
}

/// Builds the configured backend with its production collaborators.
pub fn build_backend(
    config: &ReplayConfig,
    window: Arc<dyn WindowControl>,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn CaptureBackend>> {
    match config.backend {
        BackendKind::FrameGrabber => {
            let (primary, fallback) = crate::desktop::frame_sources(&config.window_title)?;
            let sinks = frame_grabber::FfmpegSinkFactory::new(&config.encoder);
            Ok(Box::new(frame_grabber::FrameGrabberBackend::new(
                primary,
                fallback,
                Box::new(sinks),
            )))
        }
        BackendKind::EncoderProcess => Ok(Box::new(encoder::EncoderBackend::new(
            config.encoder.clone(),
            Box::new(encoder::CommandLauncher::new(&config.encoder.ffmpeg)),
        ))),
        BackendKind::ExternalHotkey => Ok(Box::new(hotkey::HotkeyBackend::from_config(
            config, window, clock,
        )?)),
    }
}
