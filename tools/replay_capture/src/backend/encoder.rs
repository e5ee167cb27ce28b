//! External encoder process bound to a screen region, with optional system
//! audio.

use std::io::{self, ErrorKind, Write};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

use super::{CaptureBackend, CaptureConfig, RecordingHandle};
use crate::config::{BackendKind, EncoderConfig};
use crate::error::{CaptureError, Result};

const BACKEND: &str = "encoder_process";
const KILL_WAIT: Duration = Duration::from_secs(1);

pub trait EncoderProcess: Send {
    fn id(&self) -> u32;

    /// `Some(exit code)` if the process ended within `timeout`.
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<i32>>;

    /// Ask for a clean shutdown over the control channel.
    fn request_stop(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;
}

pub trait EncoderLauncher: Send {
    fn launch(&self, args: &[String]) -> io::Result<Box<dyn EncoderProcess>>;
}

pub struct ChildProcess {
    child: Child,
}

impl EncoderProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .wait_timeout(timeout)?
            .map(|status| status.code().unwrap_or(-1)))
    }

    /// ffmpeg finishes the file and exits when it reads `q` on stdin.
    fn request_stop(&mut self) -> io::Result<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(b"q")?;
        stdin.flush()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

pub struct CommandLauncher {
    program: String,
}

impl CommandLauncher {
    #[must_use]
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl EncoderLauncher for CommandLauncher {
    fn launch(&self, args: &[String]) -> io::Result<Box<dyn EncoderProcess>> {
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

/// ffmpeg arguments for one recording.
#[must_use]
pub fn encoder_args(encoder: &EncoderConfig, target: &CaptureConfig, with_audio: bool) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    args.extend(["-f".into(), encoder.input_format.clone()]);
    args.extend(["-framerate".into(), target.fps.to_string()]);
    match target.region {
        Some(rect) => {
            args.extend(["-offset_x".into(), rect.x.to_string()]);
            args.extend(["-offset_y".into(), rect.y.to_string()]);
            args.extend(["-video_size".into(), format!("{}x{}", rect.width, rect.height)]);
            args.extend(["-i".into(), "desktop".into()]);
        }
        None => args.extend(["-i".into(), format!("title={}", target.window_title)]),
    }
    let audio = encoder.audio_device.as_ref().filter(|_| with_audio);
    if let Some(device) = audio {
        args.extend(["-f".into(), encoder.audio_format.clone()]);
        args.extend(["-i".into(), format!("audio={device}")]);
    }
    args.extend([
        "-vf".into(),
        format!("scale={}:{}", target.width, target.height),
        "-c:v".into(),
        encoder.codec.clone(),
        "-preset".into(),
        encoder.preset.clone(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);
    if audio.is_some() {
        args.extend(["-c:a".into(), "aac".into()]);
    } else {
        args.push("-an".into());
    }
    args.push(target.output_path.to_string_lossy().to_string());
    args
}

struct RunningEncoder {
    id: Uuid,
    process: Box<dyn EncoderProcess>,
}

pub struct EncoderBackend {
    encoder: EncoderConfig,
    launcher: Box<dyn EncoderLauncher>,
    active: Option<RunningEncoder>,
}

impl EncoderBackend {
    #[must_use]
    pub fn new(encoder: EncoderConfig, launcher: Box<dyn EncoderLauncher>) -> Self {
        Self {
            encoder,
            launcher,
            active: None,
        }
    }

    /// Launch and watch the startup probe window. `None` means the process
    /// exited before it was done.
    fn launch_probed(&self, target: &CaptureConfig, with_audio: bool) -> Result<Option<Box<dyn EncoderProcess>>> {
        let args = encoder_args(&self.encoder, target, with_audio);
        let mut process = self.launcher.launch(&args).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                CaptureError::Prerequisite(format!("{} not found on PATH", self.encoder.ffmpeg))
            } else {
                CaptureError::capture(BACKEND, format!("spawn failed: {err}"))
            }
        })?;
        let probe = Duration::from_millis(self.encoder.startup_probe_ms);
        match process.wait_timeout(probe)? {
            Some(code) => {
                warn!(code, with_audio, "encoder exited during startup");
                Ok(None)
            }
            None => Ok(Some(process)),
        }
    }
}

impl CaptureBackend for EncoderBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EncoderProcess
    }

    fn start(&mut self, target: &CaptureConfig) -> Result<RecordingHandle> {
        if self.active.is_some() {
            return Err(CaptureError::capture(BACKEND, "a recording is already running"));
        }
        if let Some(parent) = target.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let with_audio = self.encoder.audio_device.is_some();
        let mut process = self.launch_probed(target, with_audio)?;
        if process.is_none() && with_audio {
            info!("retrying encoder without audio input");
            process = self.launch_probed(target, false)?;
        }
        let process = process.ok_or_else(|| {
            CaptureError::capture(BACKEND, "encoder exited immediately after launch")
        })?;

        let handle = RecordingHandle::new(target.output_path.clone());
        info!(pid = process.id(), path = %target.output_path.display(), "encoder started");
        self.active = Some(RunningEncoder {
            id: handle.id(),
            process,
        });
        Ok(handle)
    }

    fn stop(&mut self, handle: &mut RecordingHandle) -> Result<()> {
        let owned = self
            .active
            .as_ref()
            .is_some_and(|running| running.id == handle.id());
        if !handle.mark_stopped() || !owned {
            return Ok(());
        }
        let Some(mut running) = self.active.take() else {
            return Ok(());
        };
        if let Err(err) = running.process.request_stop() {
            warn!(error = %err, "could not request graceful stop");
        }
        let timeout = Duration::from_millis(self.encoder.stop_timeout_ms);
        match running.process.wait_timeout(timeout) {
            Ok(Some(code)) => {
                info!(code, "encoder stopped");
                return Ok(());
            }
            Ok(None) => {
                warn!(pid = running.process.id(), ?timeout, "encoder ignored stop request, killing");
            }
            Err(err) => {
                warn!(pid = running.process.id(), error = %err, "waiting for encoder failed, killing");
            }
        }
        running.process.kill()?;
        if let Err(err) = running.process.wait_timeout(KILL_WAIT) {
            warn!(error = %err, "killed encoder not reaped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{encoder_args, EncoderBackend, EncoderLauncher, EncoderProcess};
    use crate::backend::{CaptureBackend, CaptureConfig, RecordingHandle};
    use crate::config::{BackendKind, EncoderConfig};
    use crate::window::ScreenRect;

    #[derive(Default)]
    struct Log {
        launches: Vec<Vec<String>>,
        stop_requests: u32,
        kills: u32,
    }

    struct FakeProcess {
        log: Arc<Mutex<Log>>,
        exits_at_startup: bool,
        honours_stop: bool,
        stop_requested: bool,
        probed: bool,
        wait_breaks: bool,
    }

    impl EncoderProcess for FakeProcess {
        fn id(&self) -> u32 {
            4242
        }

        fn wait_timeout(&mut self, _timeout: Duration) -> io::Result<Option<i32>> {
            if !self.probed {
                self.probed = true;
                return Ok(self.exits_at_startup.then_some(1));
            }
            if self.wait_breaks {
                return Err(io::Error::other("wait interrupted"));
            }
            Ok((self.stop_requested && self.honours_stop).then_some(0))
        }

        fn request_stop(&mut self) -> io::Result<()> {
            self.stop_requested = true;
            self.log.lock().expect("lock").stop_requests += 1;
            Ok(())
        }

        fn kill(&mut self) -> io::Result<()> {
            self.log.lock().expect("lock").kills += 1;
            Ok(())
        }
    }

    /// Processes launched with an audio input die at startup, like ffmpeg
    /// with a missing dshow device.
    struct FakeLauncher {
        log: Arc<Mutex<Log>>,
        audio_breaks: bool,
        honours_stop: bool,
        wait_breaks: bool,
    }

    impl EncoderLauncher for FakeLauncher {
        fn launch(&self, args: &[String]) -> io::Result<Box<dyn EncoderProcess>> {
            let with_audio = args.iter().any(|a| a.starts_with("audio="));
            self.log.lock().expect("lock").launches.push(args.to_vec());
            Ok(Box::new(FakeProcess {
                log: self.log.clone(),
                exits_at_startup: with_audio && self.audio_breaks,
                honours_stop: self.honours_stop,
                stop_requested: false,
                probed: false,
                wait_breaks: self.wait_breaks,
            }))
        }
    }

    fn encoder_config() -> EncoderConfig {
        EncoderConfig {
            audio_device: Some("Stereo Mix".to_string()),
            ..EncoderConfig::default()
        }
    }

    fn target(dir: &std::path::Path) -> CaptureConfig {
        CaptureConfig {
            fps: 20,
            width: 1920,
            height: 1080,
            output_path: dir.join("match_1.mp4"),
            backend_kind: BackendKind::EncoderProcess,
            window_title: "NIKKE".to_string(),
            region: Some(ScreenRect {
                x: 10,
                y: 20,
                width: 1280,
                height: 720,
            }),
        }
    }

    fn backend(log: &Arc<Mutex<Log>>, audio_breaks: bool, honours_stop: bool) -> EncoderBackend {
        EncoderBackend::new(
            encoder_config(),
            Box::new(FakeLauncher {
                log: log.clone(),
                audio_breaks,
                honours_stop,
                wait_breaks: false,
            }),
        )
    }

    #[test]
    fn retries_once_without_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Log::default()));
        let mut backend = backend(&log, true, true);

        let mut handle = backend.start(&target(dir.path())).expect("start");
        assert!(!handle.is_stopped());

        {
            let log = log.lock().expect("lock");
            assert_eq!(log.launches.len(), 2);
            assert!(log.launches[0].iter().any(|a| a == "audio=Stereo Mix"));
            assert!(!log.launches[1].iter().any(|a| a.starts_with("audio=")));
            assert!(log.launches[1].iter().any(|a| a == "-an"));
        }
        backend.stop(&mut handle).expect("stop");
    }

    #[test]
    fn graceful_stop_then_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Log::default()));
        let mut backend = backend(&log, false, true);

        let mut handle = backend.start(&target(dir.path())).expect("start");
        backend.stop(&mut handle).expect("stop");
        backend.stop(&mut handle).expect("second stop");

        let log = log.lock().expect("lock");
        assert_eq!(log.launches.len(), 1);
        assert_eq!(log.stop_requests, 1);
        assert_eq!(log.kills, 0);
    }

    #[test]
    fn escalates_to_kill_when_stop_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Log::default()));
        let mut backend = backend(&log, false, false);

        let mut handle = backend.start(&target(dir.path())).expect("start");
        backend.stop(&mut handle).expect("stop");
        assert_eq!(log.lock().expect("lock").kills, 1);
    }

    #[test]
    fn failed_wait_on_stop_still_kills_the_encoder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(Mutex::new(Log::default()));
        let mut backend = EncoderBackend::new(
            encoder_config(),
            Box::new(FakeLauncher {
                log: log.clone(),
                audio_breaks: false,
                honours_stop: true,
                wait_breaks: true,
            }),
        );

        let mut handle = backend.start(&target(dir.path())).expect("start");
        assert!(backend.stop(&mut handle).is_ok());
        let log = log.lock().expect("lock");
        assert_eq!(log.stop_requests, 1);
        assert_eq!(log.kills, 1);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut backend = backend(&log, false, true);
        let mut handle = RecordingHandle::new(PathBuf::from("never.mp4"));
        backend.stop(&mut handle).expect("no-op");
        assert_eq!(log.lock().expect("lock").stop_requests, 0);
    }

    #[test]
    fn args_bind_region_and_scale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = encoder_args(&EncoderConfig::default(), &target(dir.path()), true);
        let joined = args.join(" ");
        assert!(joined.contains("-f gdigrab -framerate 20 -offset_x 10 -offset_y 20 -video_size 1280x720 -i desktop"));
        assert!(joined.contains("-vf scale=1920:1080"));
        assert!(joined.contains("-an"), "no audio device configured");
    }
}
