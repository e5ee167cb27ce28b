//! In-process capture: a worker thread grabs frames at the target rate,
//! scales them to the output size and feeds a video sink.

use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

use super::{CaptureBackend, CaptureConfig, RecordingHandle};
use crate::config::{BackendKind, EncoderConfig};
use crate::error::{CaptureError, Result};
use crate::window::ScreenRect;

const BACKEND: &str = "frame_grabber";
const SINK_FINISH_TIMEOUT: Duration = Duration::from_secs(5);
/// Sink finish bound plus one frame at the slowest rate (1 fps), with slack.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(7);
const MAX_CONSECUTIVE_FAILURES: u32 = 50;

pub trait FrameSource: Send {
    fn name(&self) -> &'static str;

    fn grab(&mut self, region: &ScreenRect) -> Result<RgbaImage>;
}

pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()>;

    /// Flush and close the output file.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait SinkFactory: Send {
    fn open(&self, target: &CaptureConfig) -> Result<Box<dyn VideoSink>>;
}

/// Primary source with a slower fallback. Once the primary fails the
/// fallback is used for the rest of the recording.
struct Sources {
    primary: Option<Box<dyn FrameSource>>,
    fallback: Option<Box<dyn FrameSource>>,
    degraded: bool,
}

impl Sources {
    fn grab(&mut self, region: &ScreenRect) -> Result<RgbaImage> {
        if !self.degraded {
            if let Some(primary) = self.primary.as_mut() {
                match primary.grab(region) {
                    Ok(frame) => return Ok(frame),
                    Err(err) => {
                        warn!(
                            source = primary.name(),
                            error = %err,
                            "primary frame source failed, switching to fallback"
                        );
                        self.degraded = true;
                    }
                }
            }
        }
        match self.fallback.as_mut() {
            Some(fallback) => fallback.grab(region),
            None => Err(CaptureError::capture(BACKEND, "no frame source available")),
        }
    }
}

/// Shared with the capture thread so a writer that never reports back cannot
/// take the sources with it.
type SharedSources = Arc<Mutex<Sources>>;

fn lock_sources(sources: &SharedSources) -> MutexGuard<'_, Sources> {
    sources.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CaptureReport {
    frames: u64,
    failure: Option<String>,
}

struct ActiveCapture {
    id: Uuid,
    stop_tx: Sender<()>,
    done_rx: Receiver<CaptureReport>,
    thread: JoinHandle<()>,
}

pub struct FrameGrabberBackend {
    sources: SharedSources,
    sinks: Box<dyn SinkFactory>,
    active: Option<ActiveCapture>,
    /// Recording whose writer did not finish within the drain bound.
    unfinished: Option<Uuid>,
    drain_timeout: Duration,
}

impl FrameGrabberBackend {
    #[must_use]
    pub fn new(
        primary: Option<Box<dyn FrameSource>>,
        fallback: Option<Box<dyn FrameSource>>,
        sinks: Box<dyn SinkFactory>,
    ) -> Self {
        Self {
            sources: Arc::new(Mutex::new(Sources {
                primary,
                fallback,
                degraded: false,
            })),
            sinks,
            active: None,
            unfinished: None,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

impl CaptureBackend for FrameGrabberBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::FrameGrabber
    }

    fn start(&mut self, target: &CaptureConfig) -> Result<RecordingHandle> {
        if self.active.is_some() {
            return Err(CaptureError::capture(BACKEND, "a recording is already running"));
        }
        let region = target
            .region
            .ok_or_else(|| CaptureError::capture(BACKEND, "target window region unknown"))?;
        let sink = self.sinks.open(target)?;
        let sources = Arc::clone(&self.sources);

        let handle = RecordingHandle::new(target.output_path.clone());
        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let settings = LoopSettings {
            region,
            width: target.width,
            height: target.height,
            interval: Duration::from_secs_f64(1.0 / f64::from(target.fps.max(1))),
        };
        let thread = thread::spawn(move || {
            let report = capture_loop(sources, sink, &stop_rx, &settings);
            let _ = done_tx.send(report);
        });
        info!(path = %target.output_path.display(), fps = target.fps, "frame capture started");
        self.active = Some(ActiveCapture {
            id: handle.id(),
            stop_tx,
            done_rx,
            thread,
        });
        Ok(handle)
    }

    fn stop(&mut self, handle: &mut RecordingHandle) -> Result<()> {
        let owned = self
            .active
            .as_ref()
            .is_some_and(|active| active.id == handle.id());
        if !handle.mark_stopped() || !owned {
            return Ok(());
        }
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let _ = active.stop_tx.send(());
        match active.done_rx.recv_timeout(self.drain_timeout) {
            Ok(report) => {
                let _ = active.thread.join();
                info!(frames = report.frames, "frame capture stopped");
                if let Some(message) = report.failure {
                    if report.frames == 0 {
                        return Err(CaptureError::capture(BACKEND, message));
                    }
                    warn!(reason = %message, "capture ended early, keeping partial footage");
                }
                Ok(())
            }
            Err(_) => {
                error!(timeout = ?self.drain_timeout, "capture thread did not drain in time, detaching it");
                self.unfinished = Some(handle.id());
                Err(CaptureError::capture(
                    BACKEND,
                    format!("capture thread still running after {:?}", self.drain_timeout),
                ))
            }
        }
    }

    /// A file whose writer never reported back may still be open and
    /// incomplete, so it is not handed out.
    fn finish_artifact(&mut self, handle: &RecordingHandle) -> Result<Option<PathBuf>> {
        if self.unfinished == Some(handle.id()) {
            warn!(path = %handle.output().display(), "video writer never finished, discarding artifact");
            return Err(CaptureError::capture(
                BACKEND,
                "video writer did not finish, file may be incomplete",
            ));
        }
        let output = handle.output();
        Ok(output.exists().then(|| output.to_path_buf()))
    }
}

struct LoopSettings {
    region: ScreenRect,
    width: u32,
    height: u32,
    interval: Duration,
}

fn capture_loop(
    sources: SharedSources,
    mut sink: Box<dyn VideoSink>,
    stop_rx: &Receiver<()>,
    settings: &LoopSettings,
) -> CaptureReport {
    let mut frames = 0u64;
    let mut consecutive_failures = 0u32;
    let mut failure = None;
    {
        let mut sources = lock_sources(&sources);
        sources.degraded = sources.primary.is_none();
    }
    loop {
        let tick = Instant::now();
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        let grabbed = lock_sources(&sources).grab(&settings.region);
        match grabbed {
            Ok(frame) => {
                consecutive_failures = 0;
                let frame = fit_frame(frame, settings.width, settings.height);
                if let Err(err) = sink.write_frame(&frame) {
                    failure = Some(format!("sink rejected frame: {err}"));
                    break;
                }
                frames += 1;
            }
            Err(err) => {
                consecutive_failures += 1;
                debug!(error = %err, consecutive_failures, "frame grab failed");
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    failure = Some(format!("{consecutive_failures} consecutive grab failures: {err}"));
                    break;
                }
            }
        }
        let elapsed = tick.elapsed();
        if elapsed < settings.interval {
            match stop_rx.recv_timeout(settings.interval - elapsed) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
    if let Err(err) = sink.finish() {
        failure.get_or_insert_with(|| format!("closing video failed: {err}"));
    }
    CaptureReport { frames, failure }
}

/// The source can drift from the window's client size; every frame is
/// scaled to the output resolution.
fn fit_frame(frame: RgbaImage, width: u32, height: u32) -> RgbaImage {
    if frame.dimensions() == (width, height) {
        frame
    } else {
        imageops::resize(&frame, width, height, FilterType::Triangle)
    }
}

/// Raw RGBA frames piped into an ffmpeg child over stdin.
pub struct FfmpegPipeSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl VideoSink for FfmpegPipeSink {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CaptureError::capture(BACKEND, "encoder input closed"))?;
        stdin.write_all(frame.as_raw())?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        match self.child.wait_timeout(SINK_FINISH_TIMEOUT)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(CaptureError::capture(
                BACKEND,
                format!("ffmpeg exited with {status}"),
            )),
            None => {
                warn!("ffmpeg did not finish writing, killing it");
                self.child.kill()?;
                self.child.wait()?;
                Err(CaptureError::capture(BACKEND, "ffmpeg killed while finalizing"))
            }
        }
    }
}

pub struct FfmpegSinkFactory {
    ffmpeg: String,
    codec: String,
    preset: String,
}

impl FfmpegSinkFactory {
    #[must_use]
    pub fn new(encoder: &EncoderConfig) -> Self {
        Self {
            ffmpeg: encoder.ffmpeg.clone(),
            codec: encoder.codec.clone(),
            preset: encoder.preset.clone(),
        }
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn open(&self, target: &CaptureConfig) -> Result<Box<dyn VideoSink>> {
        if let Some(parent) = target.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .arg("-s:v")
            .arg(format!("{}x{}", target.width, target.height))
            .arg("-r")
            .arg(target.fps.to_string())
            .args(["-i", "-", "-an"])
            .args(["-c:v", &self.codec, "-preset", &self.preset, "-pix_fmt", "yuv420p"])
            .arg(&target.output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = command.spawn().map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                CaptureError::Prerequisite(format!("{} not found on PATH", self.ffmpeg))
            } else {
                CaptureError::capture(BACKEND, format!("failed to spawn ffmpeg: {err}"))
            }
        })?;
        let stdin = child.stdin.take();
        Ok(Box::new(FfmpegPipeSink { child, stdin }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use image::{Rgba, RgbaImage};

    use super::{fit_frame, FrameGrabberBackend, FrameSource, SinkFactory, VideoSink};
    use crate::backend::{CaptureBackend, CaptureConfig, RecordingHandle};
    use crate::config::BackendKind;
    use crate::error::{CaptureError, Result};
    use crate::window::ScreenRect;

    struct SolidSource {
        name: &'static str,
        fail: bool,
        grabs: Arc<AtomicU32>,
    }

    impl FrameSource for SolidSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn grab(&mut self, region: &ScreenRect) -> Result<RgbaImage> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CaptureError::capture("frame_grabber", "duplication lost"));
            }
            Ok(RgbaImage::from_pixel(region.width, region.height, Rgba([1, 2, 3, 255])))
        }
    }

    #[derive(Clone, Default)]
    struct SinkStats {
        frames: Arc<AtomicU64>,
        finished: Arc<AtomicU32>,
        last_width: Arc<AtomicU32>,
    }

    struct CountingSink(SinkStats);

    impl VideoSink for CountingSink {
        fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
            self.0.frames.fetch_add(1, Ordering::SeqCst);
            self.0.last_width.store(frame.width(), Ordering::SeqCst);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            self.0.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingSinks(SinkStats);

    impl SinkFactory for CountingSinks {
        fn open(&self, _target: &CaptureConfig) -> Result<Box<dyn VideoSink>> {
            Ok(Box::new(CountingSink(self.0.clone())))
        }
    }

    /// The first sink takes longer to close than the backend waits for.
    struct SlowFirstSinks {
        stats: SinkStats,
        opened: AtomicU32,
    }

    struct SlowSink {
        stats: SinkStats,
        delay: Duration,
    }

    impl VideoSink for SlowSink {
        fn write_frame(&mut self, _frame: &RgbaImage) -> Result<()> {
            self.stats.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            std::thread::sleep(self.delay);
            self.stats.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl SinkFactory for SlowFirstSinks {
        fn open(&self, _target: &CaptureConfig) -> Result<Box<dyn VideoSink>> {
            let delay = if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
                Duration::from_millis(400)
            } else {
                Duration::ZERO
            };
            Ok(Box::new(SlowSink {
                stats: self.stats.clone(),
                delay,
            }))
        }
    }

    fn target() -> CaptureConfig {
        CaptureConfig {
            fps: 60,
            width: 64,
            height: 36,
            output_path: PathBuf::from("match_1.mp4"),
            backend_kind: BackendKind::FrameGrabber,
            window_title: "NIKKE".to_string(),
            region: Some(ScreenRect {
                x: 0,
                y: 0,
                width: 128,
                height: 80,
            }),
        }
    }

    fn wait_for_frames(stats: &SinkStats, count: u64) {
        for _ in 0..500 {
            if stats.frames.load(Ordering::SeqCst) >= count {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn falls_back_and_resizes_every_frame() {
        let primary_grabs = Arc::new(AtomicU32::new(0));
        let stats = SinkStats::default();
        let mut backend = FrameGrabberBackend::new(
            Some(Box::new(SolidSource {
                name: "window",
                fail: true,
                grabs: primary_grabs.clone(),
            })),
            Some(Box::new(SolidSource {
                name: "monitor",
                fail: false,
                grabs: Arc::new(AtomicU32::new(0)),
            })),
            Box::new(CountingSinks(stats.clone())),
        );

        let mut handle = backend.start(&target()).expect("start");
        wait_for_frames(&stats, 3);
        backend.stop(&mut handle).expect("stop");

        assert!(stats.frames.load(Ordering::SeqCst) >= 3);
        assert_eq!(stats.last_width.load(Ordering::SeqCst), 64);
        assert_eq!(stats.finished.load(Ordering::SeqCst), 1);
        assert_eq!(primary_grabs.load(Ordering::SeqCst), 1, "primary is abandoned after one failure");
    }

    #[test]
    fn stop_is_idempotent_and_safe_before_start() {
        let stats = SinkStats::default();
        let mut backend = FrameGrabberBackend::new(
            None,
            Some(Box::new(SolidSource {
                name: "monitor",
                fail: false,
                grabs: Arc::new(AtomicU32::new(0)),
            })),
            Box::new(CountingSinks(stats.clone())),
        );

        let mut foreign = RecordingHandle::new(PathBuf::from("other.mp4"));
        backend.stop(&mut foreign).expect("never started");

        let mut handle = backend.start(&target()).expect("start");
        backend.stop(&mut handle).expect("first stop");
        backend.stop(&mut handle).expect("second stop");
        assert_eq!(stats.finished.load(Ordering::SeqCst), 1);

        let mut again = backend.start(&target()).expect("sources are returned after stop");
        backend.stop(&mut again).expect("stop");
    }

    #[test]
    fn slow_writer_keeps_sources_and_withholds_its_file() {
        let stats = SinkStats::default();
        let mut backend = FrameGrabberBackend::new(
            None,
            Some(Box::new(SolidSource {
                name: "monitor",
                fail: false,
                grabs: Arc::new(AtomicU32::new(0)),
            })),
            Box::new(SlowFirstSinks {
                stats: stats.clone(),
                opened: AtomicU32::new(0),
            }),
        )
        .with_drain_timeout(Duration::from_millis(50));

        let mut first = backend.start(&target()).expect("start");
        wait_for_frames(&stats, 1);
        assert!(backend.stop(&mut first).is_err(), "writer still closing");
        assert!(backend.finish_artifact(&first).is_err());

        backend.drain_timeout = Duration::from_secs(5);
        let mut second = backend.start(&target()).expect("sources survive a slow writer");
        backend.stop(&mut second).expect("stop");

        for _ in 0..200 {
            if stats.finished.load(Ordering::SeqCst) == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_region_fails_start() {
        let mut backend = FrameGrabberBackend::new(None, None, Box::new(CountingSinks(SinkStats::default())));
        let target = CaptureConfig {
            region: None,
            ..target()
        };
        assert!(backend.start(&target).is_err());
    }

    #[test]
    fn fit_frame_keeps_matching_sizes() {
        let frame = RgbaImage::new(64, 36);
        assert_eq!(fit_frame(frame, 64, 36).dimensions(), (64, 36));
        assert_eq!(fit_frame(RgbaImage::new(100, 50), 64, 36).dimensions(), (64, 36));
    }
}
