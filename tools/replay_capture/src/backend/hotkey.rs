//! Drives a recorder that is already running (OBS or similar) through its
//! start/stop hotkeys, then picks its output file up from disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CaptureBackend, CaptureConfig, RecordingHandle};
use crate::clock::Clock;
use crate::config::{BackendKind, HotkeyConfig, ReplayConfig};
use crate::error::{CaptureError, Result};
use crate::keys::KeyCombo;
use crate::naming;
use crate::window::WindowControl;

const BACKEND: &str = "external_hotkey";
const VIDEO_EXTENSIONS: [&str; 4] = ["mkv", "mp4", "mov", "webm"];

/// How long to watch the recorder's file before moving it. The recorder
/// keeps writing for a while after the stop hotkey.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleWait {
    pub interval: Duration,
    pub checks: u32,
    pub timeout: Duration,
}

impl SettleWait {
    #[must_use]
    pub fn from_config(hotkey: &HotkeyConfig) -> Self {
        Self {
            interval: Duration::from_millis(hotkey.settle_interval_ms),
            checks: hotkey.settle_checks.max(1),
            timeout: Duration::from_secs(hotkey.settle_timeout_secs),
        }
    }
}

impl Default for SettleWait {
    fn default() -> Self {
        Self::from_config(&HotkeyConfig::default())
    }
}

pub struct HotkeyBackend {
    window: Arc<dyn WindowControl>,
    clock: Arc<dyn Clock>,
    start_keys: KeyCombo,
    stop_keys: KeyCombo,
    source_dir: PathBuf,
    freshness: Duration,
    settle: SettleWait,
    recording: Option<Uuid>,
}

impl HotkeyBackend {
    #[must_use]
    pub fn new(
        window: Arc<dyn WindowControl>,
        clock: Arc<dyn Clock>,
        start_keys: KeyCombo,
        stop_keys: KeyCombo,
        source_dir: PathBuf,
        freshness: Duration,
    ) -> Self {
        Self {
            window,
            clock,
            start_keys,
            stop_keys,
            source_dir,
            freshness,
            settle: SettleWait::default(),
            recording: None,
        }
    }

    #[must_use]
    pub fn with_settle(mut self, settle: SettleWait) -> Self {
        self.settle = settle;
        self
    }

    pub fn from_config(
        config: &ReplayConfig,
        window: Arc<dyn WindowControl>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let source_dir = config
            .hotkey
            .source_dir
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| CaptureError::invalid("hotkey.source_dir is not set"))?;
        Ok(Self::new(
            window,
            clock,
            config.start_combo()?,
            config.stop_combo()?,
            source_dir,
            Duration::from_secs(config.hotkey.freshness_secs),
        )
        .with_settle(SettleWait::from_config(&config.hotkey)))
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Polls the size of `path` until it is non-zero and unchanged for
    /// `settle.checks` polls in a row. False if that never happens before
    /// the timeout.
    fn wait_until_settled(&self, path: &Path) -> Result<bool> {
        let deadline = self.clock.now() + self.settle.timeout;
        let mut last_size = None;
        let mut stable = 0;
        loop {
            let size = fs::metadata(path)?.len();
            if size > 0 && last_size == Some(size) {
                stable += 1;
                if stable >= self.settle.checks {
                    return Ok(true);
                }
            } else {
                stable = 0;
            }
            last_size = Some(size);
            if self.clock.now() >= deadline {
                return Ok(false);
            }
            self.clock.sleep(self.settle.interval);
        }
    }
}

impl CaptureBackend for HotkeyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ExternalHotkey
    }

    fn start(&mut self, target: &CaptureConfig) -> Result<RecordingHandle> {
        if self.recording.is_some() {
            return Err(CaptureError::capture(BACKEND, "recorder is already armed"));
        }
        if !self.window.hotkey(&self.start_keys) {
            return Err(CaptureError::capture(
                BACKEND,
                format!("start hotkey {} was not delivered", self.start_keys),
            ));
        }
        let handle = RecordingHandle::new(target.output_path.clone());
        self.recording = Some(handle.id());
        info!(keys = %self.start_keys, "external recorder started");
        Ok(handle)
    }

    fn stop(&mut self, handle: &mut RecordingHandle) -> Result<()> {
        let owned = self.recording == Some(handle.id());
        if !handle.mark_stopped() || !owned {
            return Ok(());
        }
        self.recording = None;
        if self.window.hotkey(&self.stop_keys) {
            info!(keys = %self.stop_keys, "external recorder stopped");
            Ok(())
        } else {
            Err(CaptureError::action(format!("stop hotkey {}", self.stop_keys)))
        }
    }

    fn locate_latest_artifact(&self) -> Result<Option<PathBuf>> {
        latest_video_in(&self.source_dir, SystemTime::now(), self.freshness)
    }

    /// Moves the recorder's output next to the other artifacts once the
    /// recorder is done writing it, keeping its container extension.
    fn finish_artifact(&mut self, handle: &RecordingHandle) -> Result<Option<PathBuf>> {
        let Some(found) = self.locate_latest_artifact()? else {
            warn!(dir = %self.source_dir.display(), "no fresh recording found");
            return Ok(None);
        };
        if !self.wait_until_settled(&found)? {
            warn!(path = %found.display(), timeout = ?self.settle.timeout, "recording never settled, leaving it in place");
            return Err(CaptureError::capture(
                BACKEND,
                format!("{} is still being written", found.display()),
            ));
        }
        let dest = naming::unique_path(
            handle
                .output()
                .with_extension(naming::extension_of(&found)),
        );
        naming::move_file(&found, &dest)?;
        Ok(Some(dest))
    }
}

/// Newest video file in `dir`, provided it was modified within `freshness`
/// of `now`.
pub fn latest_video_in(dir: &Path, now: SystemTime, freshness: Duration) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Err(CaptureError::Prerequisite(format!(
            "recorder output directory {} does not exist",
            dir.display()
        )));
    }
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| modified > *best) {
            newest = Some((modified, path));
        }
    }
    let Some((modified, path)) = newest else {
        return Ok(None);
    };
    let age = now.duration_since(modified).unwrap_or_default();
    if age > freshness {
        debug!(path = %path.display(), ?age, "latest recording is stale");
        return Ok(None);
    }
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use super::{latest_video_in, HotkeyBackend, SettleWait};
    use crate::backend::{CaptureBackend, CaptureConfig, RecordingHandle};
    use crate::clock::{Clock, ManualClock};
    use crate::config::BackendKind;
    use crate::keys::KeyCombo;
    use crate::window::{PointFraction, RegionFraction, ScreenRect, WindowControl};

    #[derive(Default)]
    struct Keyboard {
        presses: AtomicU32,
    }

    impl WindowControl for Keyboard {
        fn activate(&self) -> bool {
            true
        }

        fn click_relative(&self, _point: PointFraction) -> bool {
            true
        }

        fn hotkey(&self, _combo: &KeyCombo) -> bool {
            self.presses.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn screenshot(&self, _region: RegionFraction, _dest: &Path) -> bool {
            false
        }

        fn client_rect(&self) -> Option<ScreenRect> {
            None
        }
    }

    /// Virtual clock that appends to the recorder's file on each of the
    /// first `writes` sleeps, like a recorder still flushing.
    struct FlushingRecorder {
        clock: ManualClock,
        file: PathBuf,
        writes: AtomicU32,
    }

    impl FlushingRecorder {
        fn new(file: PathBuf, writes: u32) -> Self {
            Self {
                clock: ManualClock::new(),
                file,
                writes: AtomicU32::new(writes),
            }
        }
    }

    impl Clock for FlushingRecorder {
        fn now(&self) -> Duration {
            self.clock.now()
        }

        fn sleep(&self, duration: Duration) {
            let pending = self.writes.load(Ordering::SeqCst);
            if pending > 0 {
                self.writes.store(pending - 1, Ordering::SeqCst);
                let mut file = OpenOptions::new().append(true).open(&self.file).expect("open");
                file.write_all(b"frame").expect("append");
            }
            self.clock.sleep(duration);
        }
    }

    fn backend(keyboard: Arc<Keyboard>, source_dir: PathBuf) -> HotkeyBackend {
        backend_with_clock(keyboard, Arc::new(ManualClock::new()), source_dir)
    }

    fn backend_with_clock(keyboard: Arc<Keyboard>, clock: Arc<dyn Clock>, source_dir: PathBuf) -> HotkeyBackend {
        let combo = KeyCombo::parse("alt+f9").expect("combo");
        HotkeyBackend::new(keyboard, clock, combo.clone(), combo, source_dir, Duration::from_secs(60))
    }

    #[test]
    fn start_and_stop_toggle_the_flag_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keyboard = Arc::new(Keyboard::default());
        let mut backend = backend(keyboard.clone(), dir.path().to_path_buf());
        let target = CaptureConfig {
            fps: 20,
            width: 1920,
            height: 1080,
            output_path: dir.path().join("match_2.mp4"),
            backend_kind: BackendKind::ExternalHotkey,
            window_title: "NIKKE".to_string(),
            region: None,
        };

        let mut never = RecordingHandle::new(PathBuf::from("x.mp4"));
        backend.stop(&mut never).expect("no-op");
        assert_eq!(keyboard.presses.load(Ordering::SeqCst), 0);

        let mut handle = backend.start(&target).expect("start");
        assert!(backend.is_recording());
        backend.stop(&mut handle).expect("stop");
        backend.stop(&mut handle).expect("stop again");
        assert!(!backend.is_recording());
        assert_eq!(keyboard.presses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn picks_newest_video_and_ignores_other_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("older.mkv"), b"a").expect("write");
        fs::write(dir.path().join("notes.txt"), b"b").expect("write");
        std::thread::sleep(Duration::from_millis(20));
        fs::write(dir.path().join("newer.MP4"), b"c").expect("write");

        let found = latest_video_in(dir.path(), SystemTime::now(), Duration::from_secs(60))
            .expect("scan")
            .expect("video");
        assert_eq!(found.file_name().and_then(|n| n.to_str()), Some("newer.MP4"));
    }

    #[test]
    fn stale_video_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("old.mkv"), b"a").expect("write");
        let later = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(
            latest_video_in(dir.path(), later, Duration::from_secs(60)).expect("scan"),
            None
        );
    }

    #[test]
    fn finish_moves_recording_into_output_dir() {
        let source = tempfile::tempdir().expect("source");
        let output = tempfile::tempdir().expect("output");
        fs::write(source.path().join("2024-03-09 12-00-00.mkv"), b"video").expect("write");
        let mut backend = backend(Arc::new(Keyboard::default()), source.path().to_path_buf());
        let handle = RecordingHandle::new(output.path().join("match_4_20240309_120000.mp4"));

        let moved = backend.finish_artifact(&handle).expect("finish").expect("artifact");
        assert_eq!(moved, output.path().join("match_4_20240309_120000.mkv"));
        assert!(moved.exists());
        assert_eq!(fs::read_dir(source.path()).expect("read").count(), 0);
    }

    #[test]
    fn finish_waits_for_recorder_to_stop_writing() {
        let source = tempfile::tempdir().expect("source");
        let output = tempfile::tempdir().expect("output");
        let file = source.path().join("2024-03-09 12-00-00.mkv");
        fs::write(&file, b"video").expect("write");
        let clock = Arc::new(FlushingRecorder::new(file, 3));
        let mut backend =
            backend_with_clock(Arc::new(Keyboard::default()), clock.clone(), source.path().to_path_buf());
        let handle = RecordingHandle::new(output.path().join("match_1_20240309_120000.mp4"));

        let moved = backend.finish_artifact(&handle).expect("finish").expect("artifact");

        assert_eq!(fs::read(&moved).expect("moved"), b"videoframeframeframe");
        assert_eq!(clock.writes.load(Ordering::SeqCst), 0);
        // Three growing polls, then two unchanged ones.
        assert_eq!(clock.clock.sleeps().len(), 5);
    }

    #[test]
    fn recording_that_keeps_growing_is_left_in_place() {
        let source = tempfile::tempdir().expect("source");
        let output = tempfile::tempdir().expect("output");
        let file = source.path().join("2024-03-09 12-00-00.mkv");
        fs::write(&file, b"video").expect("write");
        let clock = Arc::new(FlushingRecorder::new(file.clone(), u32::MAX));
        let mut backend =
            backend_with_clock(Arc::new(Keyboard::default()), clock.clone(), source.path().to_path_buf())
                .with_settle(SettleWait {
                    interval: Duration::from_millis(500),
                    checks: 2,
                    timeout: Duration::from_secs(3),
                });
        let handle = RecordingHandle::new(output.path().join("match_2_20240309_120000.mp4"));

        assert!(backend.finish_artifact(&handle).is_err());
        assert!(file.exists());
        assert_eq!(fs::read_dir(output.path()).expect("read").count(), 0);
        assert!(clock.now() >= Duration::from_secs(3));
    }
}
