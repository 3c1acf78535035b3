//! OpenCode backend client for the pilot bridge.
//!
//! Pure HTTP client: session creation, prompting, permission replies and the
//! server-sent event stream.

mod client;
mod error;
mod types;

pub use client::{BackendEventStream, OpencodeBackend, OpencodeClient, OpencodeClientConfig};
pub use error::{OpencodeError, Result};
pub use types::{
    BridgeEvent, CreateSessionRequest, MessageId, MessageInfo, MessagePart, MessagePartDelta,
    MessagePartUpdated, MessageRole, ModelRef, PartId, PartKind, PartTime, PermissionAction,
    PermissionAsked, PermissionReply, PermissionRule, PromptError, PromptRequest, PromptResponse,
    PromptResponseInfo, SessionId, SessionInfo, SessionStatus, TextPartInput, ToolState,
};
