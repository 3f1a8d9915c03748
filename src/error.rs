//! Error types for every stage of the message pipeline.
//!
//! Each stage owns a small enum so the orchestrator can decide, per variant,
//! whether a failure is absorbed into a chat notification or surfaced to the
//! webhook boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while obtaining a Reddit access token.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing required fields: {}", .missing.join(", "))]
    Configuration { missing: Vec<&'static str> },
    #[error("token endpoint returned unexpected status code: {status}")]
    Upstream { status: u16 },
    #[error("token request failed")]
    Network(#[source] reqwest::Error),
    #[error("token response could not be decoded")]
    Protocol(#[source] reqwest::Error),
    #[error("token request cancelled")]
    Cancelled,
}

/// Failures of the external downloader process.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("downloader exited with {}", describe_exit(.code))]
    Failed { code: Option<i32>, stdout: String },
    #[error("download cancelled")]
    Cancelled,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_owned(),
    }
}

/// Post-download validation failures.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("downloaded file {} is missing", .path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("video is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
}

/// Failures talking to the Telegram Bot API.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unexpected status code: {status}")]
    Status { status: u16 },
    #[error("telegram request failed")]
    Transport(#[from] reqwest::Error),
    #[error("failed to open {}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("delivery cancelled")]
    Cancelled,
}

/// Errors the pipeline propagates to its caller. The webhook answers every
/// one of them with a 500 so Telegram retries the update.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to parse URL")]
    ParseUrl(#[source] url::ParseError),
    #[error("failed to send greeting")]
    Greeting(#[source] DeliveryError),
    #[error("failed to get video file")]
    VideoFile(#[source] GateError),
    #[error("failed to send video")]
    SendVideo(#[source] DeliveryError),
}
