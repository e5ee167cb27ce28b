//! Batch driver: prerequisites, the lock file, one orchestrator per selected
//! match (strictly one after another), and the batch summary.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::CaptureBackend;
use crate::config::{BackendKind, ReplayConfig};
use crate::error::{CaptureError, Result};
use crate::naming;
use crate::orchestrator::{MatchContext, MatchOrchestrator, MatchSession, MatchState};

pub const LOCK_FILE: &str = "capture.lock";

/// Checks that need no window: config sanity and external binaries.
pub fn check_prerequisites(config: &ReplayConfig) -> Result<()> {
    config.validate()?;
    let needs_ffmpeg =
        config.backend != BackendKind::ExternalHotkey || config.postprocess.enabled;
    if needs_ffmpeg {
        require_command(&config.encoder.ffmpeg)?;
    }
    if config.postprocess.enabled {
        require_command(&config.postprocess.ffprobe)?;
    }
    if config.backend == BackendKind::ExternalHotkey {
        if let Some(dir) = config.hotkey.source_dir.as_ref() {
            if !Path::new(dir).is_dir() {
                return Err(CaptureError::Prerequisite(format!(
                    "recorder output directory {dir} does not exist"
                )));
            }
        }
    }
    Ok(())
}

fn require_command(program: &str) -> Result<PathBuf> {
    which::which(program)
        .map_err(|_| CaptureError::Prerequisite(format!("{program} not found on PATH")))
}

#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub backend: &'static str,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub sessions: Vec<MatchSession>,
    #[serde(skip)]
    pub summary_path: Option<PathBuf>,
}

impl BatchReport {
    #[must_use]
    pub fn artifacts(&self) -> Vec<&Path> {
        self.sessions
            .iter()
            .filter_map(|s| s.artifact_path.as_deref())
            .collect()
    }
}

pub struct SessionRunner<'a> {
    ctx: MatchContext<'a>,
    backend: &'a mut dyn CaptureBackend,
    batch_id: String,
}

impl<'a> SessionRunner<'a> {
    #[must_use]
    pub fn new(ctx: MatchContext<'a>, backend: &'a mut dyn CaptureBackend) -> Self {
        Self {
            ctx,
            backend,
            batch_id: Uuid::new_v4().to_string(),
        }
    }

    /// Reuse an id already handed out, e.g. the one written to the lock file.
    #[must_use]
    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = batch_id.into();
        self
    }

    /// Run every selected match in ascending order. Match failures are
    /// logged and the batch moves on; only a missing prerequisite ends it.
    pub fn run(&mut self) -> Result<BatchReport> {
        let ctx = self.ctx;
        let config = ctx.config;
        if ctx.window.client_rect().is_none() {
            return Err(CaptureError::Prerequisite(format!(
                "window {:?} is not available",
                config.window_title
            )));
        }

        let batch_id = self.batch_id.clone();
        let started_at = Local::now();
        let mut sessions: Vec<MatchSession> = config
            .selected_matches()
            .into_iter()
            .map(MatchSession::new)
            .collect();
        info!(
            batch_id = %batch_id,
            backend = self.backend.kind().as_str(),
            matches = ?sessions.iter().map(|s| s.index).collect::<Vec<_>>(),
            "batch started"
        );

        let mut fatal = None;
        for position in 0..sessions.len() {
            if ctx.stop.is_stop_requested() {
                info!("stop requested, skipping remaining matches");
                break;
            }
            if position > 0 {
                ctx.clock.sleep(config.timings.between_matches());
            }
            let session = &mut sessions[position];
            let backend = &mut *self.backend;
            let joined = thread::scope(|scope| {
                scope
                    .spawn(move || MatchOrchestrator::new(ctx, backend).run(session))
                    .join()
            });
            let session = &mut sessions[position];
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_fatal_to_batch() => {
                    error!(match_index = session.index, error = %err, "batch aborted");
                    fatal = Some(err);
                    break;
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    error!(match_index = session.index, "match worker panicked");
                    session.mark_failed("match worker panicked");
                }
            }
        }

        let mut report = BatchReport {
            batch_id,
            backend: self.backend.kind().as_str(),
            started_at,
            ended_at: Local::now(),
            sessions,
            summary_path: None,
        };
        match write_summary(&config.output_dir(), &report) {
            Ok(path) => report.summary_path = Some(path),
            Err(err) => warn!(error = %err, "batch summary not written"),
        }
        log_summary(&report);
        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

fn log_summary(report: &BatchReport) {
    let done = report
        .sessions
        .iter()
        .filter(|s| s.status == MatchState::Done)
        .count();
    info!(
        batch_id = %report.batch_id,
        done,
        total = report.sessions.len(),
        "batch finished"
    );
    for session in &report.sessions {
        match session.artifact_path.as_ref() {
            Some(path) => info!(match_index = session.index, path = %path.display(), outcome = ?session.outcome, "artifact"),
            None => warn!(match_index = session.index, status = ?session.status, "no artifact"),
        }
    }
}

pub fn write_summary(output_dir: &Path, report: &BatchReport) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(naming::batch_summary_name(report.started_at));
    fs::write(&path, serde_json::to_string_pretty(report)?)?;
    Ok(path)
}

/// `capture.lock` in the data dir while a batch runs.
pub struct BatchLock {
    path: PathBuf,
}

impl BatchLock {
    /// Fails if a live process holds the lock. A lock left by a dead
    /// process is replaced.
    pub fn acquire(base_dir: &Path, batch_id: &str) -> Result<Self> {
        let path = base_dir.join(LOCK_FILE);
        if let Some(info) = read_lock_info(&path) {
            match info.pid {
                Some(pid) if crate::desktop::is_pid_running(pid) => {
                    return Err(CaptureError::Prerequisite(format!(
                        "another batch is running (pid {pid})"
                    )));
                }
                _ => warn!(path = %path.display(), "clearing stale lock"),
            }
        }
        fs::create_dir_all(base_dir)?;
        let contents = format!(
            "batch={batch_id}\npid={}\nstarted_at={}\n",
            std::process::id(),
            Local::now().to_rfc3339()
        );
        fs::write(&path, contents)?;
        Ok(Self { path })
    }
}

impl Drop for BatchLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct LockInfo {
    pub pid: Option<u32>,
    pub raw: String,
}

#[must_use]
pub fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let raw = fs::read_to_string(path).ok()?;
    let pid = raw.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "pid").then(|| value.trim().parse().ok()).flatten()
    });
    Some(LockInfo { pid, raw })
}
