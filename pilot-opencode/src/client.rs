use crate::error::{OpencodeError, Result};
use crate::types::{
    BridgeEvent, CreateSessionRequest, PermissionReply, PromptRequest, PromptResponse, SessionId,
    SessionInfo,
};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use std::pin::Pin;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(600);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type BackendEventStream = Pin<Box<dyn Stream<Item = Result<BridgeEvent>> + Send>>;

/// Operations the bridge needs from the OpenCode server.
#[async_trait::async_trait]
pub trait OpencodeBackend: Send + Sync {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<SessionInfo>;

    async fn prompt(&self, session_id: &SessionId, request: &PromptRequest)
    -> Result<PromptResponse>;

    async fn respond_permission(
        &self,
        session_id: &SessionId,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<()>;

    async fn subscribe_events(&self) -> Result<BackendEventStream>;
}

#[derive(Debug, Clone)]
pub struct OpencodeClientConfig {
    pub base_url: String,
    pub directory: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
    pub prompt_timeout: Duration,
}

impl OpencodeClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            directory: None,
            username: None,
            password: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct OpencodeClient {
    http: reqwest::Client,
    base_url: Url,
    config: OpencodeClientConfig,
}

impl OpencodeClient {
    pub fn new(config: OpencodeClientConfig) -> Result<Self> {
        let trimmed = config.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(OpencodeError::InvalidInput(
                "opencode base url must not be empty".to_string(),
            ));
        }
        let base_url = Url::parse(&format!("{trimmed}/"))
            .map_err(|e| OpencodeError::InvalidInput(format!("invalid opencode url: {e}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| OpencodeError::InvalidInput(format!("invalid endpoint {path}: {e}")))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let mut builder = self.http.request(method, self.endpoint(path)?);
        if let Some(directory) = self.config.directory.as_deref() {
            builder = builder.query(&[("directory", directory)]);
        }
        if let (Some(username), Some(password)) = (
            self.config.username.as_deref(),
            self.config.password.as_deref(),
        ) {
            builder = builder.basic_auth(username, Some(password));
        }
        Ok(builder)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            OpencodeError::ResponseFormat(format!("opencode json error={e} body={text}"))
        })
    }
}

#[async_trait::async_trait]
impl OpencodeBackend for OpencodeClient {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<SessionInfo> {
        let builder = self
            .request(reqwest::Method::POST, "session")?
            .timeout(self.config.request_timeout)
            .json(request);
        self.send_json(builder).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(session_id = %session_id))]
    async fn prompt(
        &self,
        session_id: &SessionId,
        request: &PromptRequest,
    ) -> Result<PromptResponse> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("session/{session_id}/message"),
            )?
            .timeout(self.config.prompt_timeout)
            .json(request);
        self.send_json(builder).await
    }

    async fn respond_permission(
        &self,
        session_id: &SessionId,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<()> {
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("session/{session_id}/permissions/{permission_id}"),
            )?
            .timeout(self.config.request_timeout)
            .json(&serde_json::json!({ "response": reply }));
        let _: serde_json::Value = self.send_json(builder).await?;
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<BackendEventStream> {
        let response = self
            .request(reqwest::Method::GET, "event")?
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let events = sse.filter_map(|item| async move {
            match item {
                Ok((_event, data)) if data.trim().is_empty() => None,
                Ok((_event, data)) => Some(BridgeEvent::parse(&data)),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(events))
    }
}

/// Builds an `Api` error from a non-2xx response body. OpenCode reports
/// failures as `{name, data: {message}}` or `{message}`; anything else is
/// carried verbatim.
fn api_error(status: u16, body: &str) -> OpencodeError {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let field = |value: &serde_json::Value, key: &str| {
        value
            .get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
    };

    let (name, message, code) = match parsed.as_ref() {
        Some(value) => {
            let message = field(value, "message")
                .or_else(|| value.get("data").and_then(|data| field(data, "message")))
                .unwrap_or_else(|| body.trim().to_string());
            (field(value, "name"), message, field(value, "code"))
        }
        None => (None, body.trim().to_string(), None),
    };
    let message = if message.is_empty() {
        format!("opencode request failed with status {status}")
    } else {
        message
    };
    OpencodeError::Api {
        name,
        message,
        status: Some(status),
        code,
    }
}

type SseItem = (String, String);

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseItem>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, BytesMut::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.windows(2).position(|pair| pair == b"\n\n") {
                    let frame = buffer.split_to(idx);
                    buffer.advance(2);
                    // Frames are decoded whole so multibyte characters never split.
                    let raw = String::from_utf8_lossy(&frame);

                    let mut event = String::new();
                    let mut data_lines = Vec::new();

                    for line in raw.lines() {
                        let line = line.trim_end();
                        if let Some(rest) = line.strip_prefix("event:") {
                            event = rest.trim_start().to_string();
                            continue;
                        }
                        if let Some(rest) = line.strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }

                    let data = data_lines.join("\n");
                    if event.is_empty() && data.is_empty() {
                        continue;
                    }
                    if event.is_empty() {
                        event = "message".to_string();
                    }
                    return Some((Ok((event, data)), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        // CR never occurs inside a UTF-8 sequence, so dropping it
                        // per chunk normalizes CRLF even when the pair is split.
                        buffer.extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));
                        continue;
                    }
                    Some(Err(e)) => return Some((Err(e.into()), (stream, buffer))),
                    None => return None,
                }
            }
        },
    )
}
