use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use replay_capture::backend::build_backend;
use replay_capture::backend::hotkey::latest_video_in;
use replay_capture::clock::SystemClock;
use replay_capture::config::{load_config, BackendKind, CliOverrides, APP_DIR};
use replay_capture::desktop;
use replay_capture::detector::EndScreenDetector;
use replay_capture::orchestrator::MatchContext;
use replay_capture::postprocess::{PostProcessor, ProcessRunner};
use replay_capture::session::{check_prerequisites, read_lock_info, BatchLock, SessionRunner, LOCK_FILE};
use replay_capture::stop::{spawn_stop_watcher, StopFlag, STOP_FILE};

#[derive(Parser)]
#[command(name = "replay_capture", version, about = "Record replays match by match")]
struct Cli {
    /// Debug-level logging (RUST_LOG still wins for specific targets).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record the selected matches.
    Run(RunArgs),
    /// Ask a running batch to finish its current match and exit.
    Stop,
    /// Show whether a batch is running.
    Status,
    /// Print the newest fresh file in the external recorder's directory.
    Latest {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    /// frame_grabber, encoder_process or external_hotkey
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Comma separated match numbers, e.g. `1,3`.
    #[arg(long, value_delimiter = ',')]
    matches: Option<Vec<usize>>,

    #[arg(long)]
    fps: Option<u32>,

    /// Seconds to wait for the result screen.
    #[arg(long = "max-wait")]
    max_wait: Option<u64>,

    /// Attach the lineup pre-roll to each clip.
    #[arg(long)]
    postprocess: bool,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            backend: self.backend,
            matches: self.matches.clone(),
            fps: self.fps,
            max_wait_secs: self.max_wait,
            postprocess: self.postprocess.then_some(true),
        }
    }
}

fn parse_backend(value: &str) -> std::result::Result<BackendKind, String> {
    BackendKind::parse(value).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Run(args) => run_batch(&args),
        Command::Stop => stop_batch(),
        Command::Status => print_status(),
        Command::Latest { config } => print_latest(config),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn ensure_app_dir() -> Result<PathBuf> {
    let cwd = env::current_dir().context("Failed to read current dir")?;
    let base_dir = cwd.join(APP_DIR);
    if !base_dir.exists() {
        fs::create_dir_all(&base_dir).context("Failed to create data dir")?;
    }
    Ok(base_dir)
}

fn run_batch(args: &RunArgs) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = load_config(&args.overrides()).context("Failed to load config")?;
    check_prerequisites(&config).context("Prerequisite check failed")?;

    let stop_path = base_dir.join(STOP_FILE);
    if stop_path.exists() {
        warn!("removing stale stop file");
        let _ = fs::remove_file(&stop_path);
    }
    let batch_id = Uuid::new_v4().to_string();
    let _lock = BatchLock::acquire(&base_dir, &batch_id)?;

    let stop = StopFlag::new();
    stop.install_ctrlc().context("Failed to install Ctrl+C handler")?;
    let done = Arc::new(AtomicBool::new(false));
    let watcher = spawn_stop_watcher(stop_path, stop.clone(), done.clone());

    let window = desktop::find_window(&config.window_title)?;
    let clock = Arc::new(SystemClock::new());
    let mut backend = build_backend(&config, window.clone(), clock.clone())?;
    let detector = EndScreenDetector::new(config.detector.clone(), config.temp_dir());
    let postprocessor = config.postprocess.enabled.then(|| {
        PostProcessor::new(
            config.postprocess.clone(),
            &config.encoder,
            config.fps,
            config.temp_dir(),
            Box::new(ProcessRunner),
        )
    });
    let ctx = MatchContext {
        config: &config,
        window: window.as_ref(),
        probe: &detector,
        clock: clock.as_ref(),
        stop: &stop,
        postprocessor: postprocessor.as_ref(),
    };

    let result = SessionRunner::new(ctx, backend.as_mut())
        .with_batch_id(batch_id)
        .run();
    done.store(true, Ordering::SeqCst);
    let _ = watcher.join();

    let report = result?;
    println!("Batch {} finished.", report.batch_id);
    for session in &report.sessions {
        match session.artifact_path.as_ref() {
            Some(path) => println!("  match {}: {}", session.index, path.display()),
            None => println!("  match {}: {:?}", session.index, session.status),
        }
    }
    if let Some(path) = report.summary_path.as_ref() {
        println!("Summary: {}", path.display());
    }
    Ok(())
}

fn stop_batch() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    if !lock_path.exists() {
        println!("No active batch found.");
        return Ok(());
    }
    let stop_path = base_dir.join(STOP_FILE);
    fs::write(&stop_path, b"stop").context("Failed to write stop file")?;
    println!("Stop signal written.");
    if let Some(pid) = read_lock_info(&lock_path).and_then(|info| info.pid) {
        if !desktop::is_pid_running(pid) {
            let _ = fs::remove_file(&lock_path);
            let _ = fs::remove_file(&stop_path);
            println!("Batch was not running; stale lock cleared.");
        }
    }
    Ok(())
}

fn print_status() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    let Some(info) = read_lock_info(&lock_path) else {
        println!("Capture status: idle");
        return Ok(());
    };
    if let Some(pid) = info.pid {
        if !desktop::is_pid_running(pid) {
            let _ = fs::remove_file(&lock_path);
            println!("Capture status: idle (stale lock cleared)");
            return Ok(());
        }
    }
    println!("Capture status: running");
    if !info.raw.trim().is_empty() {
        println!("{}", info.raw.trim_end());
    }
    Ok(())
}

fn print_latest(config_path: Option<PathBuf>) -> Result<()> {
    let overrides = CliOverrides {
        config_path,
        ..CliOverrides::default()
    };
    let config = load_config(&overrides).context("Failed to load config")?;
    let Some(dir) = config.hotkey.source_dir.as_ref() else {
        anyhow::bail!("hotkey.source_dir is not configured");
    };
    let freshness = Duration::from_secs(config.hotkey.freshness_secs);
    match latest_video_in(&PathBuf::from(dir), SystemTime::now(), freshness)? {
        Some(path) => println!("{}", path.display()),
        None => {
            info!(dir = %dir, "no recording newer than {freshness:?}");
            println!("No fresh recording in {dir}.");
        }
    }
    Ok(())
}
