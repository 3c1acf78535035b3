//! Per-channel identity resolution for inbound messages.
//!
//! The session key selects the durable backend session; the access key is what
//! allowlists and pairing requests are keyed on. In group chats they differ.

use pilot_channels::{ChannelName, InboundMessage};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessIdentity {
    pub session_key: String,
    pub access_key: String,
}

/// Canonical WhatsApp identity: groups keep their JID, phone JIDs become `+<digits>`.
pub fn normalize_whatsapp_id(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.ends_with("@g.us") {
        return trimmed.to_string();
    }
    let base = strip_suffix_ignore_case(trimmed, "@s.whatsapp.net");
    if base.starts_with('+') {
        return base.to_string();
    }
    if !base.is_empty() && base.chars().all(|c| c.is_ascii_digit()) {
        return format!("+{base}");
    }
    base.to_string()
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> &'a str {
    let split = value.len().saturating_sub(suffix.len());
    match (value.get(..split), value.get(split..)) {
        (Some(head), Some(tail)) if tail.eq_ignore_ascii_case(suffix) => head,
        _ => value,
    }
}

pub fn resolve_access_identity(message: &InboundMessage) -> AccessIdentity {
    let session_key = match message.channel {
        ChannelName::Whatsapp => normalize_whatsapp_id(&message.peer_id),
        _ => message.peer_id.clone(),
    };
    let raw = &message.raw;

    let access_key = match message.channel {
        ChannelName::Telegram => telegram_access_key(raw),
        ChannelName::Slack => id_at(raw, &["user"]),
        ChannelName::Discord => id_at(raw, &["authorId"]),
        ChannelName::Feishu => id_at(raw, &["event", "sender", "sender_id", "open_id"])
            .or_else(|| id_at(raw, &["event", "sender", "sender_id", "user_id"]))
            .or_else(|| id_at(raw, &["event", "message", "chat_id"])),
        ChannelName::Dingtalk => id_at(raw, &["senderStaffId"])
            .or_else(|| id_at(raw, &["senderId"]))
            .or_else(|| id_at(raw, &["conversationId"])),
        ChannelName::Qq => id_at(raw, &["user_id"]),
        ChannelName::Whatsapp | ChannelName::Email | ChannelName::Mochat => None,
    }
    .unwrap_or_else(|| session_key.clone());

    AccessIdentity {
        session_key,
        access_key,
    }
}

// Only private chats are keyed on the sender; groups share the chat identity.
fn telegram_access_key(raw: &Value) -> Option<String> {
    if id_at(raw, &["chat", "type"]).as_deref() != Some("private") {
        return None;
    }
    id_at(raw, &["from", "id"])
}

fn id_at(raw: &Value, path: &[&str]) -> Option<String> {
    let value = path.iter().try_fold(raw, |node, key| node.get(*key))?;
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
