use crate::error::OpencodeError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(MessageId);
id_newtype!(PartId);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parses `provider/model`. The model part may itself contain slashes.
    pub fn parse(value: &str) -> Option<Self> {
        let (provider, model) = value.trim().split_once('/')?;
        let (provider, model) = (provider.trim(), model.trim());
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: MessageId,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub role: MessageRole,
    /// Present on user messages: the model the turn was submitted with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTime {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartKind {
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        ignored: bool,
    },
    Reasoning {
        #[serde(default)]
        text: String,
        #[serde(default)]
        time: Option<PartTime>,
    },
    Tool {
        #[serde(rename = "callID", default)]
        call_id: String,
        #[serde(default)]
        tool: String,
        #[serde(default)]
        state: ToolState,
    },
    #[serde(other)]
    Other,
}

impl PartKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::Tool { .. } => "tool",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PartId>,
    #[serde(rename = "sessionID", default)]
    pub session_id: SessionId,
    #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl MessagePart {
    pub fn text(session_id: &str, message_id: &str, part_id: &str, text: &str) -> Self {
        Self {
            id: Some(PartId::new(part_id)),
            session_id: SessionId::new(session_id),
            message_id: Some(MessageId::new(message_id)),
            kind: PartKind::Text {
                text: text.to_string(),
                ignored: false,
            },
        }
    }

    /// Text of a text part that should reach the user.
    pub fn visible_text(&self) -> Option<&str> {
        match &self.kind {
            PartKind::Text {
                text,
                ignored: false,
            } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePartUpdated {
    pub part: MessagePart,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePartDelta {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "messageID", default)]
    pub message_id: Option<MessageId>,
    #[serde(rename = "partID", default)]
    pub part_id: Option<PartId>,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionAsked {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
}

/// Events published on the backend's `/event` stream that the bridge acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    MessageUpdated(MessageInfo),
    SessionStatus {
        session_id: SessionId,
        status: SessionStatus,
    },
    SessionIdle {
        session_id: SessionId,
    },
    MessagePartUpdated(MessagePartUpdated),
    MessagePartDelta(MessagePartDelta),
    PermissionAsked(PermissionAsked),
    Unknown {
        kind: String,
    },
}

#[derive(Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: serde_json::Value,
}

#[derive(Deserialize)]
struct MessageUpdatedProps {
    info: MessageInfo,
}

#[derive(Deserialize)]
struct SessionStatusProps {
    #[serde(rename = "sessionID")]
    session_id: SessionId,
    status: SessionStatus,
}

#[derive(Deserialize)]
struct SessionIdleProps {
    #[serde(rename = "sessionID")]
    session_id: SessionId,
}

impl BridgeEvent {
    /// Decodes one `{"type": ..., "properties": {...}}` payload.
    /// Event types the bridge does not route decode to `Unknown`.
    pub fn parse(data: &str) -> crate::Result<Self> {
        let envelope: EventEnvelope = serde_json::from_str(data)
            .map_err(|e| OpencodeError::StreamParse(format!("event envelope error={e}")))?;
        let properties = envelope.properties;
        let parse_err =
            |e: serde_json::Error| OpencodeError::StreamParse(format!("{} error={e}", envelope.kind));

        let event = match envelope.kind.as_str() {
            "message.updated" => {
                let props: MessageUpdatedProps =
                    serde_json::from_value(properties).map_err(parse_err)?;
                Self::MessageUpdated(props.info)
            }
            "session.status" => {
                let props: SessionStatusProps =
                    serde_json::from_value(properties).map_err(parse_err)?;
                Self::SessionStatus {
                    session_id: props.session_id,
                    status: props.status,
                }
            }
            "session.idle" => {
                let props: SessionIdleProps =
                    serde_json::from_value(properties).map_err(parse_err)?;
                Self::SessionIdle {
                    session_id: props.session_id,
                }
            }
            "message.part.updated" => {
                Self::MessagePartUpdated(serde_json::from_value(properties).map_err(parse_err)?)
            }
            "message.part.delta" => {
                Self::MessagePartDelta(serde_json::from_value(properties).map_err(parse_err)?)
            }
            "permission.asked" => {
                Self::PermissionAsked(serde_json::from_value(properties).map_err(parse_err)?)
            }
            _ => Self::Unknown {
                kind: envelope.kind.clone(),
            },
        };
        Ok(event)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::MessageUpdated(_) => "message.updated",
            Self::SessionStatus { .. } => "session.status",
            Self::SessionIdle { .. } => "session.idle",
            Self::MessagePartUpdated(_) => "message.part.updated",
            Self::MessagePartDelta(_) => "message.part.delta",
            Self::PermissionAsked(_) => "permission.asked",
            Self::Unknown { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "text")]
pub struct TextPartInput {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptRequest {
    pub parts: Vec<TextPartInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
}

impl PromptRequest {
    pub fn text(text: impl Into<String>, model: Option<ModelRef>) -> Self {
        Self {
            parts: vec![TextPartInput { text: text.into() }],
            model,
        }
    }
}

/// Failure recorded on an assistant message instead of an HTTP error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptError {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PromptError {
    pub fn into_error(self) -> OpencodeError {
        let message = self
            .data
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .unwrap_or("Unknown error")
            .to_string();
        let status = self
            .data
            .get("statusCode")
            .and_then(serde_json::Value::as_u64)
            .and_then(|status| u16::try_from(status).ok());
        let name = Some(self.name).filter(|name| !name.trim().is_empty());
        OpencodeError::Api {
            name,
            message,
            status,
            code: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptResponseInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PromptError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptResponse {
    #[serde(default)]
    pub info: PromptResponseInfo,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl PromptResponse {
    pub fn from_text(text: &str) -> Self {
        Self {
            info: PromptResponseInfo::default(),
            parts: vec![MessagePart::text("", "", "part_reply", text)],
        }
    }

    /// Visible text parts joined by newline and trimmed.
    pub fn reply_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(MessagePart::visible_text)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub permission: String,
    pub pattern: String,
    pub action: PermissionAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateSessionRequest {
    pub title: String,
    pub permission: Vec<PermissionRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}
