//! Telegram Bot API surface.
//!
//! All outbound traffic goes through [`TelegramApi`]; the delivery
//! pipeline talks to the [`Messenger`] trait so tests can substitute an
//! in-memory fake. Media uploads use multipart forms, streaming file and
//! stream payloads instead of buffering them.

pub mod receive;
pub mod types;

pub use types::{extract_inbound, ChatKind, InboundMessage, TelegramUpdate};

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::logging::targets;
use crate::transfer::ByteStream;

/// Upper bound Telegram places on one sendMediaGroup call.
pub const MAX_ALBUM_ITEMS: usize = 10;

/// Total timeout for plain JSON calls. Without one, a stalled send would
/// hang its job until the stale-slot sweep. Media uploads get the
/// configured upload budget instead.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Address of a delivered message, enough to edit or delete it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// The account the bot token resolves to.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
}

/// Send errors
#[derive(Debug, Error)]
pub enum SendError {
    #[error("telegram rejected the request: {description}")]
    Api { description: String },

    #[error("telegram request failed: {0}")]
    Network(String),

    #[error("telegram request timed out")]
    Timeout,

    #[error("failed to read upload payload: {0}")]
    Io(String),
}

/// Payload handed to a media send.
#[derive(Debug)]
pub enum MediaUpload {
    /// Re-sendable: the file is reopened per attempt.
    File(PathBuf),
    /// Re-sendable: the bytes are cloned per attempt.
    Bytes { name: String, data: Bytes },
    /// Single-shot: a retry needs a fresh stream.
    Stream { name: String, stream: ByteStream },
}

/// One album photo held in memory.
#[derive(Debug, Clone)]
pub struct PhotoBlob {
    pub name: String,
    pub data: Bytes,
}

/// Chat-platform operations the delivery pipeline needs.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<MessageRef, SendError>;

    async fn send_video(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
        html: bool,
    ) -> Result<MessageRef, SendError>;

    /// Deliver photos as one or more albums, in order. Returns every
    /// delivered message.
    async fn send_photo_album(
        &self,
        chat_id: i64,
        photos: &[PhotoBlob],
        caption: Option<&str>,
        html: bool,
    ) -> Result<Vec<MessageRef>, SendError>;

    async fn edit_text(&self, target: MessageRef, text: &str) -> Result<(), SendError>;

    async fn delete_message(&self, target: MessageRef) -> Result<(), SendError>;

    /// Whether the bot may delete other users' messages in this chat.
    async fn can_delete_messages(&self, chat_id: i64) -> bool;

    async fn identity(&self) -> Result<BotIdentity, SendError>;
}

/// No `#[serde(default)]` on `result`: that would bound `T: Default` in the
/// derived impl. Absent `Option` fields already deserialize to `None`.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMemberPayload {
    status: String,
    #[serde(default)]
    can_delete_messages: Option<bool>,
}

/// Bot API client used for all outbound traffic.
pub struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    /// Per-request timeout for media uploads.
    upload_timeout: Duration,
    /// Per-request timeout for everything else.
    call_timeout: Duration,
    me: OnceLock<BotIdentity>,
}

impl TelegramApi {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        token: String,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url,
            token,
            upload_timeout,
            call_timeout: CALL_TIMEOUT,
            me: OnceLock::new(),
        }
    }

    /// Override the plain-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Build the API endpoint URL for a method.
    fn api_url(&self, method: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{}/bot{}/{}", base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, SendError> {
        let response = self
            .client
            .post(self.api_url(method))
            .timeout(self.call_timeout)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        Self::parse_response(response).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: reqwest::multipart::Form,
    ) -> Result<T, SendError> {
        let response = self
            .client
            .post(self.api_url(method))
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;
        Self::parse_response(response).await
    }

    /// Unwrap the `{ok, result, description}` envelope. Telegram reports
    /// failures in the body with a non-2xx status; the body is
    /// authoritative.
    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SendError> {
        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| SendError::Network(format!("failed to parse response: {e}")))?;

        if !envelope.ok {
            return Err(SendError::Api {
                description: envelope
                    .description
                    .unwrap_or_else(|| format!("HTTP {status}")),
            });
        }
        envelope.result.ok_or_else(|| SendError::Api {
            description: "ok response without a result".to_string(),
        })
    }
}

#[async_trait]
impl Messenger for TelegramApi {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<MessageRef, SendError> {
        let message: types::TelegramMessage = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": text,
                }),
            )
            .await?;
        Ok(message_ref(&message))
    }

    async fn send_video(
        &self,
        chat_id: i64,
        upload: MediaUpload,
        caption: Option<&str>,
        html: bool,
    ) -> Result<MessageRef, SendError> {
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("supports_streaming", "true");
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
            if html {
                form = form.text("parse_mode", "HTML");
            }
        }
        form = form.part("video", video_part(upload).await?);

        let message: types::TelegramMessage = self.call_multipart("sendVideo", form).await?;
        Ok(message_ref(&message))
    }

    async fn send_photo_album(
        &self,
        chat_id: i64,
        photos: &[PhotoBlob],
        caption: Option<&str>,
        html: bool,
    ) -> Result<Vec<MessageRef>, SendError> {
        let mut delivered = Vec::with_capacity(photos.len());

        for (chunk_index, chunk) in photos.chunks(MAX_ALBUM_ITEMS).enumerate() {
            let chunk_caption = if chunk_index == 0 { caption } else { None };
            let media = album_media_items(chunk, chunk_caption, html);
            let media_json = serde_json::to_string(&media)
                .map_err(|e| SendError::Io(format!("failed to encode media list: {e}")))?;

            let mut form = reqwest::multipart::Form::new()
                .text("chat_id", chat_id.to_string())
                .text("media", media_json);
            for (i, photo) in chunk.iter().enumerate() {
                let part = reqwest::multipart::Part::bytes(photo.data.to_vec())
                    .file_name(photo.name.clone());
                form = form.part(format!("photo{i}"), part);
            }

            let messages: Vec<types::TelegramMessage> =
                self.call_multipart("sendMediaGroup", form).await?;
            delivered.extend(messages.iter().map(message_ref));
        }

        Ok(delivered)
    }

    async fn edit_text(&self, target: MessageRef, text: &str) -> Result<(), SendError> {
        // Result is the edited message or `true`; neither matters here.
        let _: Value = self
            .call(
                "editMessageText",
                &json!({
                    "chat_id": target.chat_id,
                    "message_id": target.message_id,
                    "text": text,
                }),
            )
            .await?;
        Ok(())
    }

    async fn delete_message(&self, target: MessageRef) -> Result<(), SendError> {
        let _: Value = self
            .call(
                "deleteMessage",
                &json!({
                    "chat_id": target.chat_id,
                    "message_id": target.message_id,
                }),
            )
            .await?;
        Ok(())
    }

    async fn can_delete_messages(&self, chat_id: i64) -> bool {
        let me = match self.identity().await {
            Ok(me) => me,
            Err(_) => return false,
        };

        let member: Result<ChatMemberPayload, SendError> = self
            .call(
                "getChatMember",
                &json!({
                    "chat_id": chat_id,
                    "user_id": me.id,
                }),
            )
            .await;

        match member {
            Ok(member) => member.status == "creator" || member.can_delete_messages.unwrap_or(false),
            Err(err) => {
                debug!(target: targets::TELEGRAM, chat_id, error = %err, "chat member lookup failed");
                false
            }
        }
    }

    async fn identity(&self) -> Result<BotIdentity, SendError> {
        if let Some(me) = self.me.get() {
            return Ok(me.clone());
        }

        let user: UserPayload = self.call("getMe", &json!({})).await?;
        let identity = BotIdentity {
            id: user.id,
            username: user.username.unwrap_or_default(),
        };
        // A concurrent fill is harmless; both copies are the same account.
        let _ = self.me.set(identity.clone());
        Ok(identity)
    }
}

fn message_ref(message: &types::TelegramMessage) -> MessageRef {
    MessageRef {
        chat_id: message.chat.id,
        message_id: message.message_id,
    }
}

/// Build the upload part for a video send without buffering file or
/// stream payloads.
async fn video_part(upload: MediaUpload) -> Result<reqwest::multipart::Part, SendError> {
    match upload {
        MediaUpload::File(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| SendError::Io(format!("failed to open {}: {e}", path.display())))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| SendError::Io(format!("failed to stat {}: {e}", path.display())))?
                .len();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("video.mp4")
                .to_string();
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
            Ok(reqwest::multipart::Part::stream_with_length(body, len).file_name(name))
        }
        MediaUpload::Bytes { name, data } => {
            Ok(reqwest::multipart::Part::bytes(data.to_vec()).file_name(name))
        }
        MediaUpload::Stream { name, stream } => {
            let part = match stream.declared_len() {
                Some(len) => reqwest::multipart::Part::stream_with_length(stream.into_body(), len),
                None => reqwest::multipart::Part::stream(stream.into_body()),
            };
            Ok(part.file_name(name))
        }
    }
}

/// Build the `media` descriptor list for one sendMediaGroup chunk.
///
/// The `attach://` names must line up with the multipart part names.
/// Telegram renders an album-level caption when exactly the first item
/// carries one.
fn album_media_items(chunk: &[PhotoBlob], caption: Option<&str>, html: bool) -> Vec<Value> {
    chunk
        .iter()
        .enumerate()
        .map(|(i, _photo)| {
            let mut item = json!({
                "type": "photo",
                "media": format!("attach://photo{i}"),
            });
            if i == 0 {
                if let Some(caption) = caption {
                    item["caption"] = json!(caption);
                    if html {
                        item["parse_mode"] = json!("HTML");
                    }
                }
            }
            item
        })
        .collect()
}

fn request_error(e: reqwest::Error) -> SendError {
    if e.is_timeout() {
        SendError::Timeout
    } else if e.is_connect() {
        SendError::Network(format!("connection failed: {e}"))
    } else {
        SendError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_api(base_url: &str) -> TelegramApi {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        TelegramApi::new(
            client,
            base_url.to_string(),
            "token".to_string(),
            Duration::from_secs(5),
        )
        // The per-request timeout overrides the client-level one.
        .with_call_timeout(Duration::from_millis(500))
    }

    #[test]
    fn test_api_url_trims_trailing_slash() {
        let api = test_api("https://api.telegram.org/");
        assert_eq!(
            api.api_url("sendMessage"),
            "https://api.telegram.org/bottoken/sendMessage"
        );
    }

    #[tokio::test]
    async fn test_send_text_connection_failure() {
        // 192.0.2.1 is TEST-NET-1, guaranteed unroutable.
        let api = test_api("http://192.0.2.1:1");
        let err = api.send_text(123, "hello").await.unwrap_err();
        assert!(matches!(err, SendError::Network(_) | SendError::Timeout));
    }

    #[tokio::test]
    async fn test_plain_call_timeout_bounds_a_stalled_server() {
        // Accept connections and never answer them.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let api = test_api(&format!("http://{addr}"));
        let err = api.send_text(1, "hello").await.unwrap_err();
        assert!(matches!(err, SendError::Timeout));
    }

    #[test]
    fn test_envelope_error_body() {
        let envelope: ApiEnvelope<types::TelegramMessage> = serde_json::from_str(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .unwrap();
        assert!(!envelope.ok);
        assert!(envelope.result.is_none());
        assert_eq!(
            envelope.description.as_deref(),
            Some("Bad Request: chat not found")
        );
    }

    #[test]
    fn test_envelope_absent_fields_read_as_none() {
        // The payload type implements no `Default`; absent fields must
        // still land as `None` through the plain derive.
        let envelope: ApiEnvelope<types::TelegramMessage> =
            serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(envelope.ok);
        assert!(envelope.result.is_none());
        assert!(envelope.description.is_none());
    }

    #[test]
    fn test_envelope_success_body() {
        let envelope: ApiEnvelope<types::TelegramMessage> = serde_json::from_str(
            r#"{"ok":true,"result":{"message_id":5,"chat":{"id":42,"type":"private"}}}"#,
        )
        .unwrap();
        assert!(envelope.ok);
        let message = envelope.result.unwrap();
        assert_eq!(message_ref(&message).message_id, 5);
        assert_eq!(message_ref(&message).chat_id, 42);
    }

    #[test]
    fn test_album_media_caption_on_first_item_only() {
        let photos = vec![
            PhotoBlob {
                name: "photo_01.jpg".to_string(),
                data: Bytes::from_static(b"a"),
            },
            PhotoBlob {
                name: "photo_02.jpg".to_string(),
                data: Bytes::from_static(b"b"),
            },
        ];

        let items = album_media_items(&photos, Some("<b>caption</b>"), true);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["media"], "attach://photo0");
        assert_eq!(items[0]["caption"], "<b>caption</b>");
        assert_eq!(items[0]["parse_mode"], "HTML");
        assert!(items[1].get("caption").is_none());
        assert_eq!(items[1]["media"], "attach://photo1");
    }

    #[test]
    fn test_album_media_plain_caption_omits_parse_mode() {
        let photos = vec![PhotoBlob {
            name: "photo_01.jpg".to_string(),
            data: Bytes::from_static(b"a"),
        }];

        let items = album_media_items(&photos, Some("plain"), false);
        assert_eq!(items[0]["caption"], "plain");
        assert!(items[0].get("parse_mode").is_none());

        let no_caption = album_media_items(&photos, None, true);
        assert!(no_caption[0].get("caption").is_none());
    }
}
