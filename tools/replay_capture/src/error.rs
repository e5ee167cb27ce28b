use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// A click/hotkey/playback action did not take effect.
    #[error("action failed: {action}")]
    ActionFailure { action: String },

    /// The recording backend could not start or died mid-recording.
    #[error("capture failed ({backend}): {message}")]
    CaptureFailure {
        backend: &'static str,
        message: String,
    },

    /// Compositing or concatenation failed; the raw clip is left in place.
    #[error("post-processing failed for {raw}: {message}")]
    PostProcessFailure { raw: PathBuf, message: String },

    /// Something the whole batch depends on is missing.
    #[error("missing prerequisite: {0}")]
    Prerequisite(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CaptureError {
    #[must_use]
    pub fn capture(backend: &'static str, message: impl Into<String>) -> Self {
        Self::CaptureFailure {
            backend,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn action(action: impl Into<String>) -> Self {
        Self::ActionFailure {
            action: action.into(),
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Errors that end the batch rather than a single match.
    #[must_use]
    pub fn is_fatal_to_batch(&self) -> bool {
        matches!(self, Self::Prerequisite(_) | Self::InvalidConfig(_))
    }
}
