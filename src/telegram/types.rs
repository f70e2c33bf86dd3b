//! Telegram update parsing helpers.

use serde::Deserialize;

/// Update payload from getUpdates.
///
/// Edited-message variants are deliberately absent: reacting to edits
/// would deliver the same link twice.
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub channel_post: Option<TelegramMessage>,
}

/// Telegram message payload.
#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub sender_chat: Option<TelegramChat>,
}

/// Telegram chat metadata.
#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(default, rename = "type")]
    pub chat_type: Option<String>,
}

/// Telegram user metadata.
#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

/// Chat category, as far as delivery behavior cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

impl ChatKind {
    pub fn from_chat_type(chat_type: Option<&str>) -> Self {
        match chat_type {
            Some("group") | Some("supergroup") => ChatKind::Group,
            Some("channel") => ChatKind::Channel,
            _ => ChatKind::Private,
        }
    }

    pub fn is_group(self) -> bool {
        matches!(self, ChatKind::Group)
    }
}

/// Parsed inbound message the bot may act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub sender_id: i64,
    pub chat_kind: ChatKind,
    pub text: String,
}

/// Extract a text-bearing message from an update.
///
/// Bot-authored messages are skipped so the bot never reacts to its own
/// deliveries. Caption text counts: links arrive attached to media too.
pub fn extract_inbound(update: &TelegramUpdate) -> Option<InboundMessage> {
    let message = update.message.as_ref().or(update.channel_post.as_ref())?;

    if let Some(from) = message.from.as_ref() {
        if from.is_bot {
            return None;
        }
    }

    let text = message
        .text
        .as_ref()
        .filter(|t| !t.is_empty())
        .or_else(|| message.caption.as_ref().filter(|t| !t.is_empty()))?
        .to_string();

    let sender_id = message
        .from
        .as_ref()
        .map(|u| u.id)
        .or_else(|| message.sender_chat.as_ref().map(|c| c.id))
        .unwrap_or(message.chat.id);

    Some(InboundMessage {
        chat_id: message.chat.id,
        message_id: message.message_id,
        sender_id,
        chat_kind: ChatKind::from_chat_type(message.chat.chat_type.as_deref()),
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_inbound_message() {
        let json = r#"{
            "update_id": 1,
            "message": {
                "message_id": 42,
                "text": "https://vm.tiktok.com/ZMabc/",
                "chat": { "id": 123, "type": "private" },
                "from": { "id": 456, "is_bot": false }
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(json).unwrap();
        let inbound = extract_inbound(&update).unwrap();
        assert_eq!(inbound.sender_id, 456);
        assert_eq!(inbound.chat_id, 123);
        assert_eq!(inbound.message_id, 42);
        assert_eq!(inbound.chat_kind, ChatKind::Private);
        assert_eq!(inbound.text, "https://vm.tiktok.com/ZMabc/");
    }

    #[test]
    fn test_extract_inbound_caption_counts_as_text() {
        let json = r#"{
            "message": {
                "message_id": 7,
                "caption": "look at this https://www.tiktok.com/@a/video/1",
                "chat": { "id": 55, "type": "supergroup" }
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(json).unwrap();
        let inbound = extract_inbound(&update).unwrap();
        assert_eq!(inbound.chat_kind, ChatKind::Group);
        assert!(inbound.text.contains("tiktok.com"));
    }

    #[test]
    fn test_extract_inbound_skips_bot() {
        let json = r#"{
            "message": {
                "message_id": 9,
                "text": "Ignore me",
                "chat": { "id": 123, "type": "private" },
                "from": { "id": 456, "is_bot": true }
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(json).unwrap();
        assert!(extract_inbound(&update).is_none());
    }

    #[test]
    fn test_extract_inbound_channel_post() {
        let json = r#"{
            "channel_post": {
                "message_id": 3,
                "text": "https://tiktok.com/@a/video/2",
                "chat": { "id": 999, "type": "channel" },
                "sender_chat": { "id": 888, "type": "channel" }
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(json).unwrap();
        let inbound = extract_inbound(&update).unwrap();
        assert_eq!(inbound.sender_id, 888);
        assert_eq!(inbound.chat_kind, ChatKind::Channel);
    }

    #[test]
    fn test_extract_inbound_no_text() {
        let json = r#"{
            "message": {
                "message_id": 4,
                "chat": { "id": 1, "type": "private" }
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(json).unwrap();
        assert!(extract_inbound(&update).is_none());
    }

    #[test]
    fn test_chat_kind_mapping() {
        assert_eq!(ChatKind::from_chat_type(Some("private")), ChatKind::Private);
        assert_eq!(ChatKind::from_chat_type(Some("group")), ChatKind::Group);
        assert_eq!(ChatKind::from_chat_type(Some("supergroup")), ChatKind::Group);
        assert_eq!(ChatKind::from_chat_type(Some("channel")), ChatKind::Channel);
        assert_eq!(ChatKind::from_chat_type(None), ChatKind::Private);
        assert!(ChatKind::Group.is_group());
        assert!(!ChatKind::Channel.is_group());
    }
}
