//! Unattended replay capture: plays each selected match, records it, stops
//! on the result screen and files the clip.

pub mod backend;
pub mod clock;
pub mod config;
pub mod desktop;
pub mod detector;
pub mod error;
pub mod keys;
pub mod naming;
pub mod orchestrator;
pub mod postprocess;
pub mod session;
pub mod stop;
pub mod window;

pub use error::{CaptureError, Result};
