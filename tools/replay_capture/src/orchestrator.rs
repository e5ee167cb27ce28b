//! One match, start to finish: play, record, watch for the result screen,
//! open the statistics view, stop, finalize the clip, back out to the list.
//!
//! The recording handle lives in a guard for the whole recording phase, so
//! every exit path stops it: early returns, errors, cancellation and
//! panics alike.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{CaptureBackend, CaptureConfig, RecordingHandle};
use crate::clock::Clock;
use crate::config::ReplayConfig;
use crate::detector::{ScreenProbe, Verdict};
use crate::error::{CaptureError, Result};
use crate::naming;
use crate::postprocess::{CompositeSpec, PostProcessor};
use crate::stop::StopSignal;
use crate::window::WindowControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    Pending,
    Playing,
    Recording,
    AwaitingResult,
    Finalizing,
    Exiting,
    Done,
    Failed,
}

impl MatchState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// How the wait for the result screen ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchSession {
    pub index: usize,
    pub status: MatchState,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub artifact_path: Option<PathBuf>,
    pub outcome: Option<MatchOutcome>,
    pub verdict: Verdict,
    pub error: Option<String>,
}

impl MatchSession {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: MatchState::Pending,
            started_at: None,
            ended_at: None,
            artifact_path: None,
            outcome: None,
            verdict: Verdict::Unknown,
            error: None,
        }
    }

    pub(crate) fn mark_failed(&mut self, reason: &str) {
        self.error = Some(reason.to_string());
        self.status = MatchState::Failed;
        self.ended_at = Some(Local::now());
    }

    fn transition(&mut self, to: MatchState) {
        if self.status.is_terminal() {
            return;
        }
        info!(match_index = self.index, from = ?self.status, to = ?to, "state");
        self.status = to;
    }
}

/// Everything a match needs besides the recording backend.
#[derive(Clone, Copy)]
pub struct MatchContext<'a> {
    pub config: &'a ReplayConfig,
    pub window: &'a dyn WindowControl,
    pub probe: &'a dyn ScreenProbe,
    pub clock: &'a dyn Clock,
    pub stop: &'a dyn StopSignal,
    pub postprocessor: Option<&'a PostProcessor>,
}

pub struct MatchOrchestrator<'a> {
    ctx: MatchContext<'a>,
    backend: &'a mut dyn CaptureBackend,
}

/// Stops the recording on drop unless it was already stopped.
struct RecordingGuard<'b> {
    backend: &'b mut dyn CaptureBackend,
    handle: RecordingHandle,
}

impl RecordingGuard<'_> {
    fn stop(&mut self) -> Result<()> {
        self.backend.stop(&mut self.handle)
    }

    fn finish_artifact(&mut self) -> Result<Option<PathBuf>> {
        self.backend.finish_artifact(&self.handle)
    }
}

impl Drop for RecordingGuard<'_> {
    fn drop(&mut self) {
        if self.handle.is_stopped() {
            return;
        }
        warn!(recording = %self.handle.id(), "recording still running on exit path, stopping");
        if let Err(err) = self.backend.stop(&mut self.handle) {
            error!(error = %err, "cleanup stop failed");
        }
    }
}

struct Lineup {
    left: PathBuf,
    right: PathBuf,
}

impl Lineup {
    fn discard(self) {
        for path in [self.left, self.right] {
            let _ = fs::remove_file(path);
        }
    }
}

impl<'a> MatchOrchestrator<'a> {
    #[must_use]
    pub fn new(ctx: MatchContext<'a>, backend: &'a mut dyn CaptureBackend) -> Self {
        Self { ctx, backend }
    }

    /// Drive `session` to `Done` or `Failed`. An `Err` is also recorded on
    /// the session; it is returned so the caller can tell batch-fatal
    /// problems apart.
    pub fn run(&mut self, session: &mut MatchSession) -> Result<()> {
        session.started_at = Some(Local::now());
        let result = self.drive(session);
        match &result {
            Ok(()) => session.transition(MatchState::Done),
            Err(err) => {
                error!(match_index = session.index, error = %err, "match failed");
                session.error = Some(err.to_string());
                session.transition(MatchState::Failed);
            }
        }
        session.ended_at = Some(Local::now());
        result
    }

    fn drive(&mut self, session: &mut MatchSession) -> Result<()> {
        let ctx = self.ctx;
        let config = ctx.config;
        let index = session.index;

        let lineup = match ctx.postprocessor {
            Some(_) => ctx.capture_lineup(index),
            None => None,
        };

        session.transition(MatchState::Playing);
        let play = config
            .layout
            .play_button(index)
            .ok_or_else(|| CaptureError::invalid(format!("no play button for match {index}")))?;
        if !ctx.window.activate() {
            warn!(match_index = index, "could not bring the window to the front");
        }
        if !ctx.window.click_relative(play) {
            if let Some(lineup) = lineup {
                lineup.discard();
            }
            return Err(CaptureError::action(format!("start playback of match {index}")));
        }
        ctx.clock.sleep(config.timings.playback_load());

        let output = config
            .output_dir()
            .join(naming::raw_artifact_name(index, Local::now(), naming::DEFAULT_VIDEO_EXT));
        let target = CaptureConfig::from_config(config, output, ctx.window.client_rect());
        let handle = match self.backend.start(&target) {
            Ok(handle) => handle,
            Err(err) => {
                if let Some(lineup) = lineup {
                    lineup.discard();
                }
                return Err(err);
            }
        };
        let mut recording = RecordingGuard {
            backend: &mut *self.backend,
            handle,
        };
        session.transition(MatchState::Recording);

        session.transition(MatchState::AwaitingResult);
        let (outcome, verdict) = ctx.await_result(index);
        session.outcome = Some(outcome);
        session.verdict = verdict;
        if outcome == MatchOutcome::Completed {
            ctx.clock.sleep(config.timings.result_animation());
            if !ctx.window.click_relative(config.layout.stats_button) {
                warn!(match_index = index, "statistics button click was not delivered");
            }
            ctx.clock.sleep(config.timings.stats_view());
        }

        session.transition(MatchState::Finalizing);
        if let Err(err) = recording.stop() {
            error!(match_index = index, error = %err, "stopping the recording failed");
        }
        let raw = recording.finish_artifact();
        drop(recording);
        let raw = match raw {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                if let Some(lineup) = lineup {
                    lineup.discard();
                }
                return Err(CaptureError::capture(
                    self.backend_name(),
                    "recording produced no file",
                ));
            }
            Err(err) => {
                if let Some(lineup) = lineup {
                    lineup.discard();
                }
                return Err(err);
            }
        };
        let finalized = ctx.finalize(index, raw, verdict, lineup);
        info!(match_index = index, path = %finalized.display(), ?outcome, "artifact ready");
        session.artifact_path = Some(finalized);

        session.transition(MatchState::Exiting);
        ctx.exit_to_menu(index);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        self.backend.kind().as_str()
    }
}

impl MatchContext<'_> {
    /// Poll until the result screen shows, the wait runs out, or a stop is
    /// requested. The stop flag is checked before every probe.
    fn await_result(&self, index: usize) -> (MatchOutcome, Verdict) {
        let started = self.clock.now();
        let max_wait = self.config.max_wait();
        loop {
            if self.stop.is_stop_requested() {
                info!(match_index = index, "stop requested, finishing match early");
                return (MatchOutcome::Cancelled, Verdict::Unknown);
            }
            let waited = self.clock.now().saturating_sub(started);
            if waited >= max_wait {
                warn!(match_index = index, ?waited, "no result screen before timeout, keeping footage");
                return (MatchOutcome::TimedOut, Verdict::Unknown);
            }
            let result = self.probe.detect(self.window);
            if result.is_matched() {
                info!(match_index = index, verdict = ?result.verdict(), ?waited, "result screen");
                return (MatchOutcome::Completed, result.verdict());
            }
            self.clock.sleep(self.config.poll_interval());
        }
    }

    fn capture_lineup(&self, index: usize) -> Option<Lineup> {
        let temp_dir = self.config.temp_dir();
        if let Err(err) = fs::create_dir_all(&temp_dir) {
            warn!(error = %err, "temp dir unavailable, skipping lineup");
            return None;
        }
        let tag = Uuid::new_v4().simple();
        let lineup = Lineup {
            left: temp_dir.join(format!("lineup_{index}_left_{tag}.png")),
            right: temp_dir.join(format!("lineup_{index}_right_{tag}.png")),
        };
        let layout = &self.config.layout;
        let captured = self.window.screenshot(layout.lineup_left, &lineup.left)
            && self.window.screenshot(layout.lineup_right, &lineup.right);
        if captured {
            debug!(match_index = index, "lineup captured");
            Some(lineup)
        } else {
            warn!(match_index = index, "lineup capture failed, pre-roll will be skipped");
            lineup.discard();
            None
        }
    }

    /// Pre-roll and archive steps. Failures here keep the clip as it was.
    fn finalize(&self, index: usize, raw: PathBuf, verdict: Verdict, lineup: Option<Lineup>) -> PathBuf {
        let mut artifact = raw;
        match (self.postprocessor, lineup) {
            (Some(processor), Some(lineup)) => {
                let spec = CompositeSpec {
                    left_image: lineup.left.clone(),
                    right_image: lineup.right.clone(),
                    verdict,
                    match_index: index,
                };
                match processor.compose(&artifact, spec) {
                    Ok(composed) => artifact = composed,
                    Err(err) => {
                        warn!(match_index = index, error = %err, "post-processing failed, keeping raw clip");
                        lineup.discard();
                    }
                }
            }
            (None, Some(lineup)) => lineup.discard(),
            _ => {}
        }
        match self.archive(index, &artifact) {
            Ok(Some(archived)) => archived,
            Ok(None) => artifact,
            Err(err) => {
                warn!(match_index = index, error = %err, "archiving failed, clip left in output dir");
                artifact
            }
        }
    }

    fn archive(&self, index: usize, artifact: &Path) -> Result<Option<PathBuf>> {
        let archive = &self.config.archive;
        let Some(target_dir) = archive.target_dir.as_ref() else {
            return Ok(None);
        };
        let dest = naming::archive_path(
            Path::new(target_dir),
            &archive.season,
            &archive.stage,
            index,
            Local::now(),
            &naming::extension_of(artifact),
        );
        naming::move_file(artifact, &dest)?;
        Ok(Some(dest))
    }

    /// Two exit clicks on fixed timing. With the exit check enabled, the
    /// result screen is probed afterwards and the clicks repeated while it
    /// is still showing.
    fn exit_to_menu(&self, index: usize) {
        let timings = &self.config.timings;
        let check = &self.config.exit_check;
        let attempts = if check.enabled { 1 + check.retries } else { 1 };
        for attempt in 1..=attempts {
            for delay in [timings.exit_first(), timings.exit_second()] {
                if !self.window.click_relative(self.config.layout.exit_point) {
                    warn!(match_index = index, "exit click was not delivered");
                }
                self.clock.sleep(delay);
            }
            if !check.enabled {
                return;
            }
            if !self.probe.detect(self.window).is_matched() {
                debug!(match_index = index, attempt, "back on the replay list");
                return;
            }
            warn!(match_index = index, attempt, "still on the result screen after exit clicks");
        }
    }
}
