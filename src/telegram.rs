//! Telegram Bot API: the slice of the update schema the webhook accepts and
//! the two outbound calls the bot makes.

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::error::DeliveryError;

pub const TELEGRAM_BASE_URL: &str = "https://api.telegram.org";

/// A webhook update. Unknown top-level keys are rejected; update kinds the
/// bot does not act on are accepted but kept opaque.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub edited_message: Option<Value>,
    pub channel_post: Option<Value>,
    pub edited_channel_post: Option<Value>,
    pub business_connection: Option<Value>,
    pub business_message: Option<Value>,
    pub edited_business_message: Option<Value>,
    pub deleted_business_messages: Option<Value>,
    pub message_reaction: Option<Value>,
    pub message_reaction_count: Option<Value>,
    pub inline_query: Option<Value>,
    pub chosen_inline_result: Option<Value>,
    pub callback_query: Option<Value>,
    pub shipping_query: Option<Value>,
    pub pre_checkout_query: Option<Value>,
    pub purchased_paid_media: Option<Value>,
    pub poll: Option<Value>,
    pub poll_answer: Option<Value>,
    pub my_chat_member: Option<Value>,
    pub chat_member: Option<Value>,
    pub chat_join_request: Option<Value>,
    pub chat_boost: Option<Value>,
    pub removed_chat_boost: Option<Value>,
}

/// Unlike [`Update`], unknown keys are ignored here and in [`User`] and
/// [`Chat`]; only the top level of an update is checked strictly.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// The three fields of an incoming message the pipeline looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender_id: Option<i64>,
    pub chat_id: i64,
    pub text: String,
}

impl Message {
    /// `None` for messages without text (stickers, photos, service messages).
    pub fn inbound(&self) -> Option<InboundMessage> {
        let text = self.text.clone()?;
        Some(InboundMessage {
            sender_id: self.from.as_ref().map(|user| user.id),
            chat_id: self.chat.id,
            text,
        })
    }
}

/// Outbound side of the chat transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;

    /// Uploads the file at `path`. The file is left in place.
    async fn send_video(&self, chat_id: i64, path: &Path) -> Result<(), DeliveryError>;
}

/// Bot API client bound to one bot token.
#[derive(Clone)]
pub struct TelegramApi {
    base_url: String,
    http: reqwest::Client,
}

impl TelegramApi {
    pub fn new(bot_token: &str, http: reqwest::Client) -> Self {
        Self::with_api_base(TELEGRAM_BASE_URL, bot_token, http)
    }

    pub fn with_api_base(api_base: &str, bot_token: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
            http,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }
}

fn check_status(status: StatusCode) -> Result<(), DeliveryError> {
    if status == StatusCode::OK {
        Ok(())
    } else {
        Err(DeliveryError::Status {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramApi {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        let chat_id = chat_id.to_string();
        let response = self
            .http
            .get(self.method_url("sendMessage"))
            .query(&[("chat_id", chat_id.as_str()), ("text", text)])
            .send()
            .await?;
        check_status(response.status())
    }

    async fn send_video(&self, chat_id: i64, path: &Path) -> Result<(), DeliveryError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| DeliveryError::File {
                path: path.to_path_buf(),
                source,
            })?;
        let length = file
            .metadata()
            .await
            .map_err(|source| DeliveryError::File {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream();

        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), length)
            .file_name(file_name)
            .mime_str(mime.as_ref())?;
        let form = Form::new().part("video", part);

        let chat_id = chat_id.to_string();
        let response = self
            .http
            .post(self.method_url("sendVideo"))
            .query(&[("chat_id", chat_id.as_str())])
            .multipart(form)
            .send()
            .await?;
        check_status(response.status())
    }
}
