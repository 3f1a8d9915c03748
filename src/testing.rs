//! In-memory fakes for the pipeline's collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::downloader::{DownloadRequest, MediaDownloader};
use crate::error::{AuthError, DeliveryError, DownloadError};
use crate::reddit::AccessTokenSource;
use crate::telegram::Notifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
    Text(i64, String),
    Video {
        chat_id: i64,
        path: PathBuf,
        /// Whether the file was on disk at the moment of sending.
        existed: bool,
    },
}

/// Records every outbound call; can be told to fail either kind.
#[derive(Default)]
pub(crate) struct FakeNotifier {
    pub sent: Mutex<Vec<Sent>>,
    pub fail_text: bool,
    pub fail_video: bool,
}

impl FakeNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().push(Sent::Text(chat_id, text.to_string()));
        if self.fail_text {
            return Err(DeliveryError::Status { status: 502 });
        }
        Ok(())
    }

    async fn send_video(&self, chat_id: i64, path: &Path) -> Result<(), DeliveryError> {
        self.sent.lock().push(Sent::Video {
            chat_id,
            path: path.to_path_buf(),
            existed: path.exists(),
        });
        if self.fail_video {
            return Err(DeliveryError::Status { status: 413 });
        }
        Ok(())
    }
}

pub(crate) struct FakeTokens {
    fail: bool,
    pub calls: Mutex<usize>,
}

impl FakeTokens {
    pub fn new(fail: bool) -> Self {
        Self {
            fail,
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl AccessTokenSource for FakeTokens {
    async fn access_token(&self, _cancel: &CancellationToken) -> Result<String, AuthError> {
        *self.calls.lock() += 1;
        if self.fail {
            Err(AuthError::Upstream { status: 500 })
        } else {
            Ok("tok".to_string())
        }
    }
}

pub(crate) enum DownloadMode {
    /// Writes this many bytes to the requested path.
    Write(usize),
    /// Claims success without writing anything.
    Nothing,
    Fail,
    WaitForCancel,
}

pub(crate) struct FakeDownloader {
    mode: DownloadMode,
    requests: Mutex<Vec<DownloadRequest>>,
    /// Set once a request's cancel token fires, even if the download future
    /// was dropped first.
    pub cancel_seen: Arc<AtomicBool>,
}

impl FakeDownloader {
    pub fn new(mode: DownloadMode) -> Self {
        Self {
            mode,
            requests: Mutex::new(Vec::new()),
            cancel_seen: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn requests(&self) -> Vec<DownloadRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaDownloader for FakeDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        self.requests.lock().push(request.clone());
        match self.mode {
            DownloadMode::Write(len) => {
                std::fs::write(&request.output_path, vec![7u8; len])
                    .map_err(|source| DownloadError::Spawn {
                        program: "fake".to_string(),
                        source,
                    })?;
                Ok(request.output_path.clone())
            }
            DownloadMode::Nothing => Ok(request.output_path.clone()),
            DownloadMode::Fail => Err(DownloadError::Failed {
                code: Some(1),
                stdout: "ERROR: private video".into(),
            }),
            DownloadMode::WaitForCancel => {
                let watched = cancel.clone();
                let seen = self.cancel_seen.clone();
                tokio::spawn(async move {
                    watched.cancelled().await;
                    seen.store(true, Ordering::SeqCst);
                });
                cancel.cancelled().await;
                Err(DownloadError::Cancelled)
            }
        }
    }
}
