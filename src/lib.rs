//! Downly - inspect and download short videos from TikTok, Facebook Reels and YouTube
//!
//! This library drives two external tools, an extractor (yt-dlp) and a transcoder (ffmpeg),
//! as child processes. It provisions their binaries on demand, runs them with timeouts and
//! cancellation, streams their output as HTTP response bodies and cleans up the temporary
//! files they leave behind.

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod formats;
pub mod pipeline;
pub mod process;
pub mod provision;
pub mod server;
pub mod transfer;
pub mod utils;

use std::time::Duration;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use formats::{EncodingDescriptor, InspectResult, QualityTier};
pub use pipeline::{DownloadPayload, DownloadRequest, InspectRequest, Pipeline};
pub use process::{OutputKind, Platform, ProcessOrchestrator};
pub use provision::{Provisioner, Tool, ToolResolver};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, DownlyError>;

/// Error types specific to the acquisition pipeline
#[derive(thiserror::Error, Debug)]
pub enum DownlyError {
    #[error("{0}")]
    Validation(String),

    #[error("Tool provisioning failed: {0}")]
    Provision(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Transcode failed: {0}")]
    Transcode(String),

    #[error("No data received within {}s - video may be restricted or too large", .0.as_secs())]
    Timeout(Duration),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl DownlyError {
    /// HTTP status the error maps to when nothing has been sent yet
    pub fn status_code(&self) -> u16 {
        match self {
            DownlyError::Validation(_) => 400,
            DownlyError::Provision(_) => 503,
            DownlyError::Extraction(_) => 502,
            DownlyError::Transcode(_) => 500,
            DownlyError::Timeout(_) => 504,
            DownlyError::Io(_) => 500,
        }
    }
}
