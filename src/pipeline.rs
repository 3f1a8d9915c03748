//! The message-to-video pipeline.
//!
//! One inbound message walks through authorization, command handling, URL
//! checks, token acquisition, download, size validation and delivery. The first
//! step that decides the outcome ends the walk. Expected failures (dead links,
//! oversized videos) become a chat notice and an `Ok` outcome; failures the
//! webhook caller should retry are returned as [`PipelineError`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, warn};
use url::Url;

use crate::downloader::{DownloadRequest, MediaDownloader};
use crate::error::{AuthError, DeliveryError, DownloadError, GateError, PipelineError};
use crate::reddit::{AccessTokenSource, is_reddit_url};
use crate::scratch::{ScratchFile, validate_size};
use crate::telegram::{InboundMessage, Notifier};

pub const START_COMMAND: &str = "/start";
pub const START_RESPONSE: &str = "Hello, send a Reddit link to a video to begin";
pub const PARSE_FAILED_TEXT: &str = "Failed to parse URL";
pub const DOWNLOAD_FAILED_TEXT: &str = "Failed to download video";
pub const VIDEO_FILE_FAILED_TEXT: &str = "Failed to get video file";
pub const TOO_LARGE_TEXT: &str = "Video is too large";
pub const SEND_FAILED_TEXT: &str = "Failed to send video";

/// Per-request values threaded through every step: the span log lines are
/// attached to and the token that aborts in-flight work.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub span: Span,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(span: Span, cancel: CancellationToken) -> Self {
        Self { span, cancel }
    }
}

/// How a handled message ended when nothing needs to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Sender is not the configured personal ID.
    Unauthorized,
    Greeted,
    /// Link does not point at Reddit.
    NotReddit,
    DownloadFailed,
    TooLarge,
    Delivered,
    /// The request was aborted before finishing.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// `None` accepts messages from anyone.
    pub personal_id: Option<i64>,
    pub scratch_dir: PathBuf,
    pub max_video_bytes: u64,
}

pub struct MessagePipeline {
    tokens: Arc<dyn AccessTokenSource>,
    downloader: Arc<dyn MediaDownloader>,
    notifier: Arc<dyn Notifier>,
    settings: PipelineSettings,
}

impl MessagePipeline {
    pub fn new(
        tokens: Arc<dyn AccessTokenSource>,
        downloader: Arc<dyn MediaDownloader>,
        notifier: Arc<dyn Notifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            tokens,
            downloader,
            notifier,
            settings,
        }
    }

    pub async fn handle(
        &self,
        message: &InboundMessage,
        ctx: &RequestContext,
    ) -> Result<Outcome, PipelineError> {
        async {
            info!(text = %message.text, "Handling message");
            let result = self.run(message, &ctx.cancel).await;
            match &result {
                Ok(outcome) => info!(?outcome, "Finished handling message"),
                Err(err) => error!(error = %err, "Message handling failed"),
            }
            result
        }
        .instrument(ctx.span.clone())
        .await
    }

    async fn run(
        &self,
        message: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let chat_id = message.chat_id;

        if let Some(personal_id) = self.settings.personal_id
            && message.sender_id != Some(personal_id)
        {
            warn!(sender = ?message.sender_id, "Message is not from personal ID, ignoring");
            return Ok(Outcome::Unauthorized);
        }

        if message.text == START_COMMAND {
            info!("Received start command");
            cancellable(cancel, self.notifier.send_text(chat_id, START_RESPONSE))
                .await
                .map_err(PipelineError::Greeting)?;
            return Ok(Outcome::Greeted);
        }

        let url = match Url::parse(message.text.trim()) {
            Ok(url) => url,
            Err(err) => {
                self.notify(chat_id, PARSE_FAILED_TEXT, cancel).await;
                return Err(PipelineError::ParseUrl(err));
            }
        };

        if !is_reddit_url(&url) {
            warn!(host = ?url.host_str(), "URL is not from Reddit, ignoring");
            return Ok(Outcome::NotReddit);
        }

        // Fallback policy: without a token the download is still attempted
        // against the public host, it just tends to get rate limited.
        let token = match self.tokens.access_token(cancel).await {
            Ok(token) => token,
            Err(AuthError::Cancelled) => return Ok(Outcome::Cancelled),
            Err(err) => {
                warn!(error = %err, "Failed to get Reddit API token, download will likely fail");
                String::new()
            }
        };

        let request = DownloadRequest::new(&url, &token, &self.settings.scratch_dir);
        let artifact = ScratchFile::new(request.output_path.clone());

        let path = match self.downloader.download(&request, cancel).await {
            Ok(path) => path,
            Err(DownloadError::Cancelled) => return Ok(Outcome::Cancelled),
            Err(err) => {
                error!(error = %err, "Failed to download video");
                self.notify(chat_id, DOWNLOAD_FAILED_TEXT, cancel).await;
                return Ok(Outcome::DownloadFailed);
            }
        };
        let artifact = if path == artifact.path() {
            artifact
        } else {
            ScratchFile::new(path)
        };

        let size = match validate_size(artifact.path(), self.settings.max_video_bytes).await {
            Ok(size) => size,
            Err(GateError::TooLarge { .. }) => {
                self.notify(chat_id, TOO_LARGE_TEXT, cancel).await;
                return Ok(Outcome::TooLarge);
            }
            Err(err @ GateError::NotFound { .. }) => {
                self.notify(chat_id, VIDEO_FILE_FAILED_TEXT, cancel).await;
                return Err(PipelineError::VideoFile(err));
            }
        };

        info!(size, "Sending video");
        match cancellable(cancel, self.notifier.send_video(chat_id, artifact.path())).await {
            Ok(()) => Ok(Outcome::Delivered),
            Err(DeliveryError::Cancelled) => Ok(Outcome::Cancelled),
            Err(err) => {
                self.notify(chat_id, SEND_FAILED_TEXT, cancel).await;
                Err(PipelineError::SendVideo(err))
            }
        }
    }

    /// Best-effort error notice; a failure here is only logged.
    async fn notify(&self, chat_id: i64, text: &str, cancel: &CancellationToken) {
        if let Err(err) = cancellable(cancel, self.notifier.send_text(chat_id, text)).await {
            warn!(error = %err, text, "Failed to send error notification");
        }
    }
}

async fn cancellable<F>(cancel: &CancellationToken, delivery: F) -> Result<(), DeliveryError>
where
    F: Future<Output = Result<(), DeliveryError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
        result = delivery => result,
    }
}
