//! yt-dlp integration.
//!
//! The pipeline only sees the [`MediaDownloader`] trait; [`YtDlp`] is the
//! production implementation that shells out to the real binary.

use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, Stdio};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::DownloadError;
use crate::reddit::{USER_AGENT, authenticated_url};

/// Everything one downloader run needs. Built per message, used once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: Url,
    /// Value of the `Authorization` header, always `Bearer <token>`; the token
    /// may be empty when authentication failed.
    pub authorization: String,
    pub output_dir: PathBuf,
    pub output_path: PathBuf,
}

impl DownloadRequest {
    /// Rewrites the link to the OAuth host when `token` is non-empty and picks
    /// a fresh file name under `scratch_dir`.
    pub fn new(target: &Url, token: &str, scratch_dir: &Path) -> Self {
        Self {
            url: authenticated_url(target, token),
            authorization: format!("Bearer {token}"),
            output_dir: scratch_dir.to_path_buf(),
            output_path: scratch_dir.join(format!("{}.mp4", Uuid::new_v4())),
        }
    }
}

#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Runs the download and returns the path the file is expected at. The
    /// file's existence is not checked here.
    async fn download(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError>;
}

/// Runs yt-dlp (or a compatible binary) as a child process.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(request: &DownloadRequest) -> Vec<String> {
        vec![
            "--add-header".to_string(),
            format!("Authorization: {}", request.authorization),
            "--add-header".to_string(),
            format!("User-Agent: {USER_AGENT}"),
            "-P".to_string(),
            request.output_dir.display().to_string(),
            "-o".to_string(),
            request.output_path.display().to_string(),
            "-v".to_string(),
            request.url.to_string(),
        ]
    }
}

#[async_trait]
impl MediaDownloader for YtDlp {
    async fn download(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        info!(url = %request.url, output = %request.output_path.display(), "Starting download");

        // kill_on_drop also covers the request future being dropped when the
        // webhook client disconnects.
        let child = Command::new(&self.program)
            .args(Self::args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DownloadError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Download cancelled, killing {}", self.program);
                return Err(DownloadError::Cancelled);
            }
            output = child.wait_with_output() => output.map_err(|source| DownloadError::Spawn {
                program: self.program.clone(),
                source,
            })?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        info!(stdout = %stdout, "yt-dlp output");
        debug!(stderr = %String::from_utf8_lossy(&output.stderr), "yt-dlp diagnostics");

        if !output.status.success() {
            return Err(DownloadError::Failed {
                code: output.status.code(),
                stdout,
            });
        }

        Ok(request.output_path.clone())
    }
}

/// Runs `<name> --version` so a missing downloader shows up at startup rather
/// than on the first message.
pub fn ensure_program_available(name: &str) -> Result<()> {
    let status = StdCommand::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", name),
        Err(err) => bail!("{} is not installed or not in PATH: {}", name, err),
    }
}
