use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every chat platform the bridge knows how to relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelName {
    Telegram,
    Whatsapp,
    Slack,
    Feishu,
    Discord,
    Dingtalk,
    Email,
    Mochat,
    Qq,
}

impl ChannelName {
    pub const ALL: [ChannelName; 9] = [
        Self::Telegram,
        Self::Whatsapp,
        Self::Slack,
        Self::Feishu,
        Self::Discord,
        Self::Dingtalk,
        Self::Email,
        Self::Mochat,
        Self::Qq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Slack => "slack",
            Self::Feishu => "feishu",
            Self::Discord => "discord",
            Self::Dingtalk => "dingtalk",
            Self::Email => "email",
            Self::Mochat => "mochat",
            Self::Qq => "qq",
        }
    }

    /// Human-facing label used in status lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Telegram => "Telegram",
            Self::Whatsapp => "WhatsApp",
            Self::Slack => "Slack",
            Self::Feishu => "Feishu",
            Self::Discord => "Discord",
            Self::Dingtalk => "DingTalk",
            Self::Email => "Email",
            Self::Mochat => "Mochat",
            Self::Qq => "QQ",
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelName {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|channel| channel.as_str() == normalized)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {value:?}"))
    }
}

/// A message received from a chat platform.
///
/// `raw` is the adapter's original payload; the bridge only reads a few
/// well-known fields from it (sender ids, chat type, platform message id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: ChannelName,
    pub peer_id: String,
    pub text: String,
    #[serde(default)]
    pub raw: serde_json::Value,
    #[serde(default)]
    pub from_me: bool,
}

impl InboundMessage {
    pub fn new(channel: ChannelName, peer_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel,
            peer_id: peer_id.into(),
            text: text.into(),
            raw: serde_json::Value::Null,
            from_me: false,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_from_me(mut self, from_me: bool) -> Self {
        self.from_me = from_me;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    Reply,
    System,
    Tool,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub progress: bool,
    pub typing: bool,
    pub file: bool,
}

/// Platform id of a message created or edited by `send_text_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressReceipt {
    pub message_id: i64,
}
