//! Normalization and user-facing classification of backend failures.

use crate::support::text::prefix_chars;
use pilot_opencode::OpencodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedError {
    pub name: Option<String>,
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
}

impl From<&OpencodeError> for NormalizedError {
    fn from(error: &OpencodeError) -> Self {
        let message = error.to_string();
        let message = if message.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            message.trim().to_string()
        };
        Self {
            name: error.name().map(ToOwned::to_owned),
            message,
            status: error.status(),
            code: error.code().map(ToOwned::to_owned),
        }
    }
}

/// Normalizes any error. Blank non-backend errors yield `None`.
pub fn normalize(error: &anyhow::Error) -> Option<NormalizedError> {
    if let Some(backend) = error.downcast_ref::<OpencodeError>() {
        return Some(backend.into());
    }
    let message = error.to_string();
    let message = message.trim();
    if message.is_empty() {
        return None;
    }
    Some(NormalizedError {
        name: None,
        message: message.to_string(),
        status: None,
        code: None,
    })
}

/// Whether the backend no longer knows the session. With `session_id`, a
/// not-found message naming that id also counts.
pub fn is_session_not_found(error: &NormalizedError, session_id: Option<&str>) -> bool {
    let name = error.name.as_deref().unwrap_or_default().to_ascii_lowercase();
    let message = error.message.to_lowercase();

    let not_found = error.status == Some(404)
        || name.contains("notfound")
        || message.contains("not found")
        || message.contains("resource not found");
    if !not_found {
        return false;
    }

    if message.contains("/storage/session/")
        || message.contains("session not found")
        || message.contains("enoent")
    {
        return true;
    }

    session_id.is_some_and(|id| !id.is_empty() && message.contains(&id.to_lowercase()))
}

/// Maps a failure to a fixed notice, checked in priority order.
pub fn build_error_message(error: &anyhow::Error) -> String {
    match normalize(error) {
        Some(normalized) => classify(&normalized),
        None => "Error: failed to reach OpenCode.".to_string(),
    }
}

pub fn classify(error: &NormalizedError) -> String {
    let message = error.message.as_str();
    let lower = message.to_lowercase();
    let status = error.status;
    let has = |needle: &str| lower.contains(needle);

    if is_session_not_found(error, None) {
        return "Error: OpenCode session expired and could not recover. Send /reset and try again."
            .to_string();
    }
    if status == Some(401) || has("401") || has("unauthorized") {
        return "Error: OpenCode authentication failed (401). Check credentials.".to_string();
    }
    if status == Some(403) || has("403") || has("forbidden") {
        return "Error: OpenCode access forbidden (403).".to_string();
    }
    if status == Some(404) || has("404") || has("not found") {
        return "Error: OpenCode endpoint not found (404).".to_string();
    }
    if status == Some(429) || has("429") || has("rate limit") {
        return "Error: Rate limited. Please wait and try again.".to_string();
    }
    if status == Some(500) || has("500") || has("internal server") {
        return "Error: OpenCode server error (500).".to_string();
    }
    if has("model") || has("provider") {
        return format!("Error: Model/provider issue - {}", prefix_chars(message, 100));
    }
    if error.code.as_deref() == Some("ECONNREFUSED") || has("econnrefused") || has("connection") {
        return "Error: Cannot connect to OpenCode. Is it running?".to_string();
    }
    if message.trim().is_empty() {
        return "Error: failed to reach OpenCode.".to_string();
    }
    format!("Error: {}", prefix_chars(message, 150))
}
