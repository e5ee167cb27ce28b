#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::{Rgb, RgbImage};

use replay_capture::backend::{CaptureBackend, CaptureConfig, RecordingHandle};
use replay_capture::config::{BackendKind, ReplayConfig};
use replay_capture::detector::{DetectionResult, ScreenProbe, Verdict};
use replay_capture::error::{CaptureError, Result};
use replay_capture::keys::KeyCombo;
use replay_capture::postprocess::{CommandOutput, CommandRunner};
use replay_capture::stop::StopFlag;
use replay_capture::window::{PointFraction, RegionFraction, ScreenRect, WindowControl};

pub fn test_config(dir: &Path) -> ReplayConfig {
    ReplayConfig {
        output_dir: dir.join("recordings").to_string_lossy().to_string(),
        temp_dir: dir.join("tmp").to_string_lossy().to_string(),
        max_wait_secs: 30,
        ..ReplayConfig::default()
    }
}

/// Accepts every action and records clicks. Screenshots are small PNGs.
#[derive(Default)]
pub struct FakeWindow {
    pub clicks: Mutex<Vec<PointFraction>>,
    pub fail_clicks: AtomicBool,
    pub missing: AtomicBool,
}

impl FakeWindow {
    pub fn clicks(&self) -> Vec<PointFraction> {
        self.clicks.lock().expect("lock").clone()
    }
}

impl WindowControl for FakeWindow {
    fn activate(&self) -> bool {
        true
    }

    fn click_relative(&self, point: PointFraction) -> bool {
        if self.fail_clicks.load(Ordering::SeqCst) {
            return false;
        }
        self.clicks.lock().expect("lock").push(point);
        true
    }

    fn hotkey(&self, _combo: &KeyCombo) -> bool {
        true
    }

    fn screenshot(&self, _region: RegionFraction, dest: &Path) -> bool {
        RgbImage::from_pixel(32, 48, Rgb([90, 90, 90])).save(dest).is_ok()
    }

    fn client_rect(&self) -> Option<ScreenRect> {
        if self.missing.load(Ordering::SeqCst) {
            return None;
        }
        Some(ScreenRect {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        })
    }
}

/// Returns queued results, then `fallback` forever. Can raise a stop flag or
/// panic on a given probe to simulate interruptions.
pub struct ScriptedProbe {
    queue: Mutex<VecDeque<DetectionResult>>,
    fallback: DetectionResult,
    pub calls: AtomicUsize,
    stop_on_call: Option<(usize, StopFlag)>,
    panic_on_call: Option<usize>,
}

impl ScriptedProbe {
    pub fn never() -> Self {
        Self::with(Vec::new(), DetectionResult::unmatched())
    }

    /// Unmatched `misses` times, then a result screen with `verdict`, then
    /// unmatched again (back on the list after exit).
    pub fn after(misses: usize, verdict: Verdict) -> Self {
        let mut queue = vec![DetectionResult::unmatched(); misses];
        queue.push(DetectionResult::matched(verdict));
        Self::with(queue, DetectionResult::unmatched())
    }

    pub fn with(queue: Vec<DetectionResult>, fallback: DetectionResult) -> Self {
        Self {
            queue: Mutex::new(queue.into()),
            fallback,
            calls: AtomicUsize::new(0),
            stop_on_call: None,
            panic_on_call: None,
        }
    }

    pub fn stopping(mut self, call: usize, flag: StopFlag) -> Self {
        self.stop_on_call = Some((call, flag));
        self
    }

    pub fn panicking(mut self, call: usize) -> Self {
        self.panic_on_call = Some(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScreenProbe for ScriptedProbe {
    fn detect(&self, _window: &dyn WindowControl) -> DetectionResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on_call == Some(call) {
            panic!("probe exploded on call {call}");
        }
        if let Some((at, flag)) = self.stop_on_call.as_ref() {
            if *at == call {
                flag.request();
            }
        }
        self.queue
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

#[derive(Default)]
pub struct BackendLog {
    pub starts: Vec<PathBuf>,
    pub stops: usize,
    pub active: bool,
}

/// Writes a placeholder clip on start. Starting a match listed in
/// `fail_for` fails.
pub struct FakeBackend {
    pub log: Arc<Mutex<BackendLog>>,
    pub fail_for: Vec<String>,
    pub fatal: bool,
    current: Option<uuid::Uuid>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(BackendLog::default())),
            fail_for: Vec::new(),
            fatal: false,
            current: None,
        }
    }

    pub fn failing_for(matches: &[usize]) -> Self {
        Self {
            fail_for: matches.iter().map(|m| format!("match_{m}_")).collect(),
            ..Self::new()
        }
    }

    pub fn stops(&self) -> usize {
        self.log.lock().expect("lock").stops
    }

    pub fn starts(&self) -> usize {
        self.log.lock().expect("lock").starts.len()
    }

    pub fn is_active(&self) -> bool {
        self.log.lock().expect("lock").active
    }
}

impl CaptureBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::FrameGrabber
    }

    fn start(&mut self, target: &CaptureConfig) -> Result<RecordingHandle> {
        let name = target
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.fail_for.iter().any(|prefix| name.starts_with(prefix)) {
            if self.fatal {
                return Err(CaptureError::Prerequisite("ffmpeg vanished".to_string()));
            }
            return Err(CaptureError::capture("frame_grabber", "device lost"));
        }
        if let Some(parent) = target.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target.output_path, b"simulated footage")?;
        let handle = RecordingHandle::new(target.output_path.clone());
        self.current = Some(handle.id());
        let mut log = self.log.lock().expect("lock");
        log.starts.push(target.output_path.clone());
        log.active = true;
        Ok(handle)
    }

    fn stop(&mut self, handle: &mut RecordingHandle) -> Result<()> {
        if !handle.mark_stopped() || self.current != Some(handle.id()) {
            return Ok(());
        }
        self.current = None;
        let mut log = self.log.lock().expect("lock");
        log.stops += 1;
        log.active = false;
        Ok(())
    }
}

/// Stands in for ffmpeg and ffprobe. Reports a silent clip and writes a
/// placeholder to each step's output, except the concat step when
/// `fail_concat` is set.
#[derive(Default)]
pub struct FakeFfmpeg {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fail_concat: bool,
}

impl FakeFfmpeg {
    pub fn failing_concat() -> Self {
        Self {
            fail_concat: true,
            ..Self::default()
        }
    }
}

impl CommandRunner for FakeFfmpeg {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.calls.lock().expect("lock").push(program.to_string());
        let mut output = CommandOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        };
        if program == "ffprobe" {
            output.stdout = r#"{"streams":[]}"#.to_string();
        } else if self.fail_concat && args.iter().any(|a| a == "-filter_complex") {
            output.success = false;
            output.stderr = "concat failed".to_string();
        } else {
            let out = args.last().expect("output arg");
            fs::write(out, b"clip").expect("write output");
        }
        Ok(output)
    }
}
