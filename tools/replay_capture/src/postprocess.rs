//! Pre-roll composition: a two-sided lineup card with a verdict badge, held
//! for a couple of seconds, then joined in front of the match footage.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EncoderConfig, PostProcessConfig};
use crate::detector::Verdict;
use crate::error::{CaptureError, Result};

pub const CANVAS_WIDTH: u32 = 1920;
pub const CANVAS_HEIGHT: u32 = 1080;

const BADGE_WIDTH: u32 = 240;
const BADGE_HEIGHT: u32 = 72;
const BADGE_TOP: u32 = 48;
const WIN_GREEN: Rgb<u8> = Rgb([46, 204, 64]);
const LOSS_RED: Rgb<u8> = Rgb([220, 40, 40]);
const BACKDROP: Rgb<u8> = Rgb([12, 12, 16]);

/// Inputs for one pre-roll. Consumed by a single `compose` call.
#[derive(Debug, Clone)]
pub struct CompositeSpec {
    pub left_image: PathBuf,
    pub right_image: PathBuf,
    pub verdict: Verdict,
    pub match_index: usize,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program, args = %args.join(" "), "running");
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// First audio stream of a clip, as reported by ffprobe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioLayout {
    pub channel_layout: String,
    pub sample_rate: u32,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    channel_layout: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
}

pub fn parse_probe(json: &str) -> Result<Option<AudioLayout>> {
    let probe: ProbeOutput = serde_json::from_str(json)?;
    let Some(stream) = probe.streams.into_iter().next() else {
        return Ok(None);
    };
    let channel_layout = stream
        .channel_layout
        .filter(|layout| !layout.is_empty() && layout != "unknown")
        .unwrap_or_else(|| match stream.channels {
            Some(1) => "mono".to_string(),
            _ => "stereo".to_string(),
        });
    let sample_rate = stream
        .sample_rate
        .and_then(|rate| rate.parse().ok())
        .unwrap_or(48_000);
    Ok(Some(AudioLayout {
        channel_layout,
        sample_rate,
    }))
}

/// Lineup card: each image fitted into its half, centered, plus a badge on
/// the winning half.
pub fn build_canvas(left: &RgbImage, right: &RgbImage, verdict: Verdict) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(CANVAS_WIDTH, CANVAS_HEIGHT, BACKDROP);
    let half = CANVAS_WIDTH / 2;
    for (image, origin_x) in [(left, 0), (right, half)] {
        let fitted = fit_within(image, half, CANVAS_HEIGHT);
        let x = origin_x + (half - fitted.width()) / 2;
        let y = (CANVAS_HEIGHT - fitted.height()) / 2;
        imageops::overlay(&mut canvas, &fitted, i64::from(x), i64::from(y));
    }
    let badge = match verdict {
        Verdict::Win => Some((0, WIN_GREEN)),
        Verdict::Loss => Some((half, LOSS_RED)),
        Verdict::Unknown => None,
    };
    if let Some((origin_x, color)) = badge {
        let x0 = origin_x + (half - BADGE_WIDTH) / 2;
        for y in BADGE_TOP..BADGE_TOP + BADGE_HEIGHT {
            for x in x0..x0 + BADGE_WIDTH {
                canvas.put_pixel(x, y, color);
            }
        }
    }
    canvas
}

fn fit_within(image: &RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return RgbImage::new(1, 1);
    }
    let scale = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    );
    let fitted_width = ((f64::from(width) * scale).round() as u32).clamp(1, max_width);
    let fitted_height = ((f64::from(height) * scale).round() as u32).clamp(1, max_height);
    imageops::resize(image, fitted_width, fitted_height, FilterType::Triangle)
}

pub struct PostProcessor {
    settings: PostProcessConfig,
    ffmpeg: String,
    codec: String,
    preset: String,
    fps: u32,
    temp_dir: PathBuf,
    runner: Box<dyn CommandRunner>,
}

impl PostProcessor {
    #[must_use]
    pub fn new(
        settings: PostProcessConfig,
        encoder: &EncoderConfig,
        fps: u32,
        temp_dir: PathBuf,
        runner: Box<dyn CommandRunner>,
    ) -> Self {
        Self {
            settings,
            ffmpeg: encoder.ffmpeg.clone(),
            codec: encoder.codec.clone(),
            preset: encoder.preset.clone(),
            fps,
            temp_dir,
            runner,
        }
    }

    /// Produce the final clip next to `raw`. The raw clip and temp images
    /// are removed only once the joined file exists; on any failure they are
    /// left where they are.
    pub fn compose(&self, raw: &Path, spec: CompositeSpec) -> Result<PathBuf> {
        let fail = |message: String| CaptureError::PostProcessFailure {
            raw: raw.to_path_buf(),
            message,
        };
        fs::create_dir_all(&self.temp_dir)?;
        let tag = Uuid::new_v4().simple().to_string();
        let composite = self
            .temp_dir
            .join(format!("composite_{}_{tag}.png", spec.match_index));
        let still = self
            .temp_dir
            .join(format!("still_{}_{tag}.mp4", spec.match_index));
        let joined = self
            .temp_dir
            .join(format!("joined_{}_{tag}.mp4", spec.match_index));

        let left = image::open(&spec.left_image)
            .map_err(|err| fail(format!("left lineup unreadable: {err}")))?
            .to_rgb8();
        let right = image::open(&spec.right_image)
            .map_err(|err| fail(format!("right lineup unreadable: {err}")))?
            .to_rgb8();
        let saved = build_canvas(&left, &right, spec.verdict)
            .save(&composite)
            .map_err(|err| fail(format!("composite not saved: {err}")));
        if let Err(err) = saved.and_then(|()| self.join_preroll(raw, &composite, &still, &joined)) {
            for temp in [&joined, &still, &composite] {
                remove_quietly(temp);
            }
            return Err(err);
        }

        let final_path = raw.with_extension("mp4");
        crate::naming::move_file(&joined, &final_path)?;
        if final_path != raw {
            fs::remove_file(raw)?;
        }
        for temp in [&still, &composite, &spec.left_image, &spec.right_image] {
            remove_quietly(temp);
        }
        info!(path = %final_path.display(), match_index = spec.match_index, "pre-roll attached");
        Ok(final_path)
    }

    /// Renders the still clip from `composite` and concatenates it in front
    /// of `raw` into `joined`.
    fn join_preroll(&self, raw: &Path, composite: &Path, still: &Path, joined: &Path) -> Result<()> {
        let audio = self.probe_audio(raw)?;
        debug!(?audio, "raw clip audio");

        let still_args = self.still_args(composite, audio.as_ref(), still);
        self.run_step(raw, "still clip", &still_args, still)?;

        let concat_args = self.concat_args(still, raw, audio.is_some(), joined);
        self.run_step(raw, "concat", &concat_args, joined)
    }

    fn probe_audio(&self, raw: &Path) -> Result<Option<AudioLayout>> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "a:0".to_string(),
            "-show_entries".to_string(),
            "stream=channel_layout,channels,sample_rate".to_string(),
            "-of".to_string(),
            "json".to_string(),
            raw.to_string_lossy().to_string(),
        ];
        let output = self.runner.run(&self.settings.ffprobe, &args)?;
        if !output.success {
            return Err(CaptureError::PostProcessFailure {
                raw: raw.to_path_buf(),
                message: format!("ffprobe failed: {}", output.stderr.trim()),
            });
        }
        parse_probe(&output.stdout)
    }

    fn still_args(&self, composite: &Path, audio: Option<&AudioLayout>, out: &Path) -> Vec<String> {
        let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y", "-loop", "1"]);
        args.extend(strings(&["-framerate", &self.fps.to_string()]));
        args.extend(["-i".to_string(), composite.to_string_lossy().to_string()]);
        if let Some(layout) = audio {
            args.extend(strings(&["-f", "lavfi", "-i"]));
            args.push(format!(
                "anullsrc=channel_layout={}:sample_rate={}",
                layout.channel_layout, layout.sample_rate
            ));
        }
        args.extend(strings(&["-t", &self.settings.still_secs.to_string()]));
        args.extend(strings(&["-c:v", &self.codec, "-preset", &self.preset, "-pix_fmt", "yuv420p"]));
        if audio.is_some() {
            args.extend(strings(&["-c:a", "aac", "-shortest"]));
        }
        args.push(out.to_string_lossy().to_string());
        args
    }

    fn concat_args(&self, still: &Path, raw: &Path, with_audio: bool, out: &Path) -> Vec<String> {
        let scale = format!("scale={CANVAS_WIDTH}:{CANVAS_HEIGHT},setsar=1,fps={}", self.fps);
        let graph = if with_audio {
            format!(
                "[0:v]{scale}[v0];[1:v]{scale}[v1];[v0][0:a][v1][1:a]concat=n=2:v=1:a=1[v][a]"
            )
        } else {
            format!("[0:v]{scale}[v0];[1:v]{scale}[v1];[v0][v1]concat=n=2:v=1:a=0[v]")
        };
        let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y"]);
        args.extend(["-i".to_string(), still.to_string_lossy().to_string()]);
        args.extend(["-i".to_string(), raw.to_string_lossy().to_string()]);
        args.extend(["-filter_complex".to_string(), graph]);
        args.extend(strings(&["-map", "[v]"]));
        if with_audio {
            args.extend(strings(&["-map", "[a]", "-c:a", "aac"]));
        }
        args.extend(strings(&["-c:v", &self.codec, "-preset", &self.preset, "-pix_fmt", "yuv420p"]));
        args.push(out.to_string_lossy().to_string());
        args
    }

    /// A step succeeds only with exit status 0 and a non-empty output file.
    fn run_step(&self, raw: &Path, step: &str, args: &[String], out: &Path) -> Result<()> {
        let output = self.runner.run(&self.ffmpeg, args)?;
        let written = fs::metadata(out).map(|meta| meta.len() > 0).unwrap_or(false);
        if output.success && written {
            return Ok(());
        }
        warn!(step, stderr = %output.stderr.trim(), "ffmpeg step failed");
        Err(CaptureError::PostProcessFailure {
            raw: raw.to_path_buf(),
            message: format!("{step} failed: {}", output.stderr.trim()),
        })
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_string()).collect()
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_file(path) {
            debug!(path = %path.display(), error = %err, "temp file not removed");
        }
    }
}
