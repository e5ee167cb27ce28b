//! Cooperative cancellation: Ctrl+C and a `stop.signal` file both raise the
//! same flag, which the orchestrator polls and never blocks on.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

pub const STOP_FILE: &str = "stop.signal";

pub trait StopSignal: Send + Sync {
    fn is_stop_requested(&self) -> bool;
}

#[derive(Clone, Default)]
pub struct StopFlag {
    requested: Arc<AtomicBool>,
}

impl StopFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, finishing current match");
            flag.request();
        })
    }
}

impl StopSignal for StopFlag {
    fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Watches for the stop file written by `replay_capture stop`. The file is
/// consumed when seen. The thread exits once `done` is set.
pub fn spawn_stop_watcher(
    stop_path: PathBuf,
    flag: StopFlag,
    done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            if stop_path.exists() {
                info!(path = %stop_path.display(), "stop file found");
                if let Err(err) = fs::remove_file(&stop_path) {
                    warn!(error = %err, "failed to remove stop file");
                }
                flag.request();
                break;
            }
            thread::sleep(Duration::from_millis(250));
        }
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::{spawn_stop_watcher, StopFlag, StopSignal, STOP_FILE};

    #[test]
    fn clones_share_one_flag() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!other.is_stop_requested());
        flag.request();
        assert!(other.is_stop_requested());
    }

    #[test]
    fn watcher_raises_flag_and_consumes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stop_path = dir.path().join(STOP_FILE);
        fs::write(&stop_path, b"stop").expect("write stop file");

        let flag = StopFlag::new();
        let done = Arc::new(AtomicBool::new(false));
        let handle = spawn_stop_watcher(stop_path.clone(), flag.clone(), done.clone());
        handle.join().expect("watcher thread");

        assert!(flag.is_stop_requested());
        assert!(!stop_path.exists());
        done.store(true, Ordering::SeqCst);
    }
}
