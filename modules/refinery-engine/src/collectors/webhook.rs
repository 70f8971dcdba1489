// Inbound webhook normalization: chat-platform updates plus generic,
// discord, and slack shapes, all reduced to IngestRecords.

use serde::Deserialize;

use refinery_common::{IngestRecord, MediaRef};

/// What a webhook body normalizes to.
#[derive(Debug, Clone)]
pub enum WebhookPayload {
    Record(IngestRecord),
    /// Slack URL-verification: echo this challenge back.
    Challenge(String),
    /// Recognized but carries nothing to ingest.
    Ignored,
}

// --- Chat platform ---

#[derive(Debug, Deserialize)]
pub struct ChatUpdate {
    pub message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub message_id: Option<i64>,
    pub chat: ChatInfo,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<ChatAttachment>,
    #[serde(default)]
    pub photo: Option<ChatAttachment>,
    #[serde(default)]
    pub audio: Option<ChatAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct ChatInfo {
    pub id: serde_json::Value,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatAttachment {
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Chat ids arrive as numbers or strings depending on the platform.
fn id_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn normalize_chat(update: ChatUpdate) -> WebhookPayload {
    let Some(message) = update.message else {
        return WebhookPayload::Ignored;
    };

    let text = message
        .text
        .or(message.caption)
        .unwrap_or_default();

    let media = [message.document, message.photo, message.audio]
        .into_iter()
        .flatten()
        .find_map(|a| {
            a.file_url.map(|url| MediaRef {
                url,
                mime_type: a.mime_type,
            })
        });

    if text.is_empty() && media.is_none() {
        return WebhookPayload::Ignored;
    }

    let title = message
        .chat
        .title
        .or(message.chat.username)
        .unwrap_or_else(|| "chat".to_string());

    WebhookPayload::Record(IngestRecord {
        chat_id: id_to_string(&message.chat.id),
        message_id: message.message_id.map(|id| id.to_string()),
        title,
        text,
        media,
    })
}

// --- Generic / Discord / Slack ---

pub fn normalize_generic(body: serde_json::Value) -> WebhookPayload {
    let text = ["text", "content", "message", "body"]
        .iter()
        .find_map(|k| body.get(k).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string();
    if text.is_empty() {
        return WebhookPayload::Ignored;
    }

    let title = body
        .get("title")
        .or_else(|| body.get("source"))
        .and_then(|v| v.as_str())
        .unwrap_or("webhook")
        .to_string();
    let chat_id = body
        .get("chat_id")
        .map(id_to_string)
        .unwrap_or_else(|| "webhook:generic".to_string());

    WebhookPayload::Record(IngestRecord {
        chat_id,
        message_id: body.get("id").map(id_to_string),
        title,
        text,
        media: None,
    })
}

pub fn normalize_discord(body: serde_json::Value) -> WebhookPayload {
    let text = body
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if text.is_empty() {
        return WebhookPayload::Ignored;
    }

    let title = body
        .pointer("/author/username")
        .and_then(|v| v.as_str())
        .unwrap_or("discord")
        .to_string();
    let chat_id = body
        .get("channel_id")
        .map(id_to_string)
        .map(|id| format!("discord:{id}"))
        .unwrap_or_else(|| "webhook:discord".to_string());

    WebhookPayload::Record(IngestRecord {
        chat_id,
        message_id: body.get("id").map(id_to_string),
        title,
        text,
        media: None,
    })
}

pub fn normalize_slack(body: serde_json::Value) -> WebhookPayload {
    if body.get("type").and_then(|v| v.as_str()) == Some("url_verification") {
        if let Some(challenge) = body.get("challenge").and_then(|v| v.as_str()) {
            return WebhookPayload::Challenge(challenge.to_string());
        }
        return WebhookPayload::Ignored;
    }

    let Some(event) = body.get("event") else {
        return WebhookPayload::Ignored;
    };
    if event.get("type").and_then(|v| v.as_str()) != Some("message") {
        return WebhookPayload::Ignored;
    }

    let text = event
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if text.is_empty() {
        return WebhookPayload::Ignored;
    }

    let chat_id = event
        .get("channel")
        .map(id_to_string)
        .map(|c| format!("slack:{c}"))
        .unwrap_or_else(|| "webhook:slack".to_string());

    WebhookPayload::Record(IngestRecord {
        chat_id,
        message_id: event.get("ts").map(id_to_string),
        title: "slack".to_string(),
        text,
        media: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_update_with_text() {
        let update: ChatUpdate = serde_json::from_value(json!({
            "message": {
                "message_id": 42,
                "chat": { "id": -100123, "title": "Macro Chat" },
                "text": "Central bank hikes rates 25bp."
            }
        }))
        .unwrap();

        let WebhookPayload::Record(record) = normalize_chat(update) else {
            panic!("expected a record");
        };
        assert_eq!(record.chat_id, "-100123");
        assert_eq!(record.title, "Macro Chat");
        assert_eq!(record.message_id.as_deref(), Some("42"));
        assert!(record.media.is_none());
    }

    #[test]
    fn chat_update_with_document_and_caption() {
        let update: ChatUpdate = serde_json::from_value(json!({
            "message": {
                "chat": { "id": "c9", "username": "tipster" },
                "caption": "see attached",
                "document": { "file_url": "https://files.test/report.pdf", "mime_type": "application/pdf" }
            }
        }))
        .unwrap();

        let WebhookPayload::Record(record) = normalize_chat(update) else {
            panic!("expected a record");
        };
        assert_eq!(record.text, "see attached");
        let media = record.media.unwrap();
        assert_eq!(media.url, "https://files.test/report.pdf");
        assert_eq!(media.mime_type.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn empty_chat_update_is_ignored() {
        let update: ChatUpdate =
            serde_json::from_value(json!({ "message": { "chat": { "id": 1 } } })).unwrap();
        assert!(matches!(normalize_chat(update), WebhookPayload::Ignored));
    }

    #[test]
    fn generic_accepts_alternate_text_keys() {
        let payload = normalize_generic(json!({ "content": "hello", "source": "pager" }));
        let WebhookPayload::Record(record) = payload else {
            panic!("expected a record");
        };
        assert_eq!(record.text, "hello");
        assert_eq!(record.title, "pager");
    }

    #[test]
    fn discord_message_normalizes() {
        let payload = normalize_discord(json!({
            "content": "fed speakers today",
            "author": { "username": "deskbot" },
            "channel_id": "555"
        }));
        let WebhookPayload::Record(record) = payload else {
            panic!("expected a record");
        };
        assert_eq!(record.chat_id, "discord:555");
        assert_eq!(record.title, "deskbot");
    }

    #[test]
    fn slack_url_verification_echoes_challenge() {
        let payload = normalize_slack(json!({
            "type": "url_verification",
            "challenge": "abc123"
        }));
        assert!(matches!(payload, WebhookPayload::Challenge(c) if c == "abc123"));
    }

    #[test]
    fn slack_message_event_normalizes() {
        let payload = normalize_slack(json!({
            "type": "event_callback",
            "event": { "type": "message", "text": "cpi beats", "channel": "C01", "ts": "171234.001" }
        }));
        let WebhookPayload::Record(record) = payload else {
            panic!("expected a record");
        };
        assert_eq!(record.chat_id, "slack:C01");
        assert_eq!(record.text, "cpi beats");
    }

    #[test]
    fn slack_non_message_event_is_ignored() {
        let payload = normalize_slack(json!({
            "type": "event_callback",
            "event": { "type": "reaction_added" }
        }));
        assert!(matches!(payload, WebhookPayload::Ignored));
    }
}
