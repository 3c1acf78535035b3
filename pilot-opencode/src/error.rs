use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpencodeError>;

#[derive(Debug, Error)]
pub enum OpencodeError {
    /// The backend answered and reported a failure.
    #[error("{message}")]
    Api {
        name: Option<String>,
        message: String,
        status: Option<u16>,
        code: Option<String>,
    },

    /// The request never produced a response.
    #[error("{message}")]
    Transport {
        message: String,
        code: Option<String>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),

    #[error("OpenCode session recovery failed. Send /reset and retry.")]
    RecoveryExhausted,
}

impl OpencodeError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            name: None,
            message: message.into(),
            status: Some(status),
            code: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Api { name, .. } => name.as_deref(),
            Self::Transport { .. } => Some("TransportError"),
            Self::InvalidInput(_) => Some("InvalidInput"),
            Self::ResponseFormat(_) => Some("ResponseFormatError"),
            Self::StreamParse(_) => Some("StreamParseError"),
            Self::RecoveryExhausted => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => *status,
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } | Self::Transport { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OpencodeError {
    fn from(e: reqwest::Error) -> Self {
        // Keep URLs (and any credentials in them) out of user-facing messages.
        let e = e.without_url();
        if let Some(status) = e.status() {
            return Self::api(status.as_u16(), e.to_string());
        }
        if e.is_connect() {
            return Self::Transport {
                message: format!("connection refused: {e}"),
                code: Some("ECONNREFUSED".to_string()),
            };
        }
        if e.is_timeout() {
            return Self::Transport {
                message: format!("connection timed out: {e}"),
                code: Some("ETIMEDOUT".to_string()),
            };
        }
        if e.is_decode() {
            return Self::ResponseFormat(e.to_string());
        }
        Self::Transport {
            message: e.to_string(),
            code: None,
        }
    }
}

impl From<serde_json::Error> for OpencodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
