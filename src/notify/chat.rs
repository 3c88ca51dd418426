//! Chat delivery
//!
//! Video uploads stream from disk to avoid loading the whole file into RAM.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::TelegramConfig;

pub type ChatId = i64;

/// Largest file the bot API accepts for upload (50 MiB)
pub const MAX_UPLOAD_BYTES: u64 = 52_428_800;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat rejected the message: {0}")]
    Rejected(String),

    #[error("failed to read {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An assembled video ready for upload
#[derive(Debug, Clone)]
pub struct VideoPayload {
    pub path: PathBuf,
    pub size: u64,
    pub thumbnail: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Outbound side of the chat front-end
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_text(&self, target: ChatId, text: &str, silent: bool) -> Result<(), ChatError>;

    async fn send_photo(
        &self,
        target: ChatId,
        photo: &[u8],
        caption: &str,
        silent: bool,
    ) -> Result<(), ChatError>;

    async fn send_video(
        &self,
        target: ChatId,
        video: &VideoPayload,
        caption: &str,
        timeout: Duration,
        silent: bool,
    ) -> Result<(), ChatError>;

    async fn send_document(
        &self,
        target: ChatId,
        path: &Path,
        caption: &str,
        silent: bool,
    ) -> Result<(), ChatError>;

    async fn send_keyboard(
        &self,
        target: ChatId,
        title: &str,
        keyboard: &[Vec<String>],
        silent: bool,
    ) -> Result<(), ChatError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API client
#[derive(Clone)]
pub struct TelegramSink {
    client: Client,
    endpoint: String,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig) -> Option<Self> {
        let token = config.bot_token.as_ref()?;
        Some(Self {
            client: Client::new(),
            endpoint: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.endpoint, method)
    }

    async fn check(response: reqwest::Response) -> Result<(), ChatError> {
        let body: ApiResponse = response.json().await?;
        if body.ok {
            Ok(())
        } else {
            Err(ChatError::Rejected(
                body.description.unwrap_or_else(|| "no description".to_string()),
            ))
        }
    }

    fn base_form(target: ChatId, caption: &str, silent: bool) -> Form {
        Form::new()
            .text("chat_id", target.to_string())
            .text("caption", caption.to_string())
            .text("disable_notification", silent.to_string())
    }

    async fn file_part(path: &Path) -> Result<(Part, u64), ChatError> {
        let file_error = |source| ChatError::File {
            path: path.to_path_buf(),
            source,
        };
        let size = tokio::fs::metadata(path).await.map_err(file_error)?.len();
        let file = File::open(path).await.map_err(file_error)?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file")
            .to_string();
        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), size)
            .file_name(file_name);
        Ok((part, size))
    }
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send_text(&self, target: ChatId, text: &str, silent: bool) -> Result<(), ChatError> {
        let response = self
            .client
            .post(self.url("sendMessage"))
            .json(&json!({
                "chat_id": target,
                "text": text,
                "disable_notification": silent,
            }))
            .send()
            .await?;
        Self::check(response).await
    }

    async fn send_photo(
        &self,
        target: ChatId,
        photo: &[u8],
        caption: &str,
        silent: bool,
    ) -> Result<(), ChatError> {
        let part = Part::bytes(photo.to_vec())
            .file_name("status.jpeg")
            .mime_str("image/jpeg")?;
        let form = Self::base_form(target, caption, silent).part("photo", part);

        let response = self
            .client
            .post(self.url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn send_video(
        &self,
        target: ChatId,
        video: &VideoPayload,
        caption: &str,
        timeout: Duration,
        silent: bool,
    ) -> Result<(), ChatError> {
        let (part, size) = Self::file_part(&video.path).await?;
        let thumbnail = Part::bytes(video.thumbnail.clone())
            .file_name("thumbnail.jpeg")
            .mime_str("image/jpeg")?;
        let form = Self::base_form(target, caption, silent)
            .text("width", video.width.to_string())
            .text("height", video.height.to_string())
            .text("supports_streaming", "true")
            .part("video", part.mime_str("video/mp4")?)
            .part("thumbnail", thumbnail);

        let response = self
            .client
            .post(self.url("sendVideo"))
            .timeout(timeout)
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await?;

        info!(
            "Uploaded video {:?} ({:.2} MB)",
            video.path,
            size as f64 / (1024.0 * 1024.0)
        );
        Ok(())
    }

    async fn send_document(
        &self,
        target: ChatId,
        path: &Path,
        caption: &str,
        silent: bool,
    ) -> Result<(), ChatError> {
        let (part, size) = Self::file_part(path).await?;
        let form = Self::base_form(target, caption, silent).part("document", part);

        let response = self
            .client
            .post(self.url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await?;
        debug!("Sent document {:?} ({} bytes)", path, size);
        Ok(())
    }

    async fn send_keyboard(
        &self,
        target: ChatId,
        title: &str,
        keyboard: &[Vec<String>],
        silent: bool,
    ) -> Result<(), ChatError> {
        let response = self
            .client
            .post(self.url("sendMessage"))
            .json(&json!({
                "chat_id": target,
                "text": title,
                "disable_notification": silent,
                "reply_markup": {
                    "keyboard": keyboard,
                    "resize_keyboard": true,
                },
            }))
            .send()
            .await?;
        Self::check(response).await
    }
}
