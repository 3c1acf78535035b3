use crate::traits::ChannelAdapter;
use crate::types::{AdapterCapabilities, ChannelName, InboundMessage, ProgressReceipt};
use anyhow::Result;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_MAX_TEXT_LENGTH: usize = 4096;
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
const TELEGRAM_NOT_MODIFIED: &str = "message is not modified";

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    groups_enabled: bool,
    shutdown: std::sync::Arc<Mutex<Option<CancellationToken>>>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, groups_enabled: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.to_string(),
            groups_enabled,
            shutdown: Default::default(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))?)
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let parsed: TelegramEnvelope<T> = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!("telegram {method} returned unparseable body: status={status} error={e}")
        })?;
        match parsed.result {
            Some(result) if parsed.ok => Ok(result),
            _ => Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} description={}",
                parsed.description.unwrap_or(text)
            )),
        }
    }

    async fn bot_username(&self) -> Option<String> {
        match self
            .call::<TelegramBotUser>("getMe", serde_json::json!({}))
            .await
        {
            Ok(me) => me.username,
            Err(error) => {
                tracing::warn!(%error, "telegram getMe failed; group mentions cannot be matched");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel(&self) -> ChannelName {
        ChannelName::Telegram
    }

    fn max_text_length(&self) -> usize {
        TELEGRAM_MAX_TEXT_LENGTH
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            progress: true,
            typing: true,
            file: false,
        }
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut shutdown = self
                .shutdown
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if shutdown.is_some() {
                return Ok(());
            }
            *shutdown = Some(token.clone());
        }

        let username = if self.groups_enabled {
            self.bot_username().await
        } else {
            None
        };
        let adapter = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("telegram adapter stopped");
                }
                result = adapter.run_poll_loop(tx, username) => {
                    if let Err(e) = result {
                        tracing::error!(%e, "telegram poll loop exited");
                    }
                }
            }
        });
        tracing::info!("telegram adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let token = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    async fn send_text(&self, peer_id: &str, text: &str) -> Result<()> {
        let _: TelegramSentMessage = self
            .call(
                "sendMessage",
                serde_json::json!({ "chat_id": peer_id, "text": text }),
            )
            .await?;
        Ok(())
    }

    async fn send_text_progress(
        &self,
        peer_id: &str,
        text: &str,
        message_id: Option<i64>,
    ) -> Result<ProgressReceipt> {
        if let Some(message_id) = message_id {
            let edited = self
                .call::<serde_json::Value>(
                    "editMessageText",
                    serde_json::json!({
                        "chat_id": peer_id,
                        "message_id": message_id,
                        "text": text,
                    }),
                )
                .await;
            return match edited {
                Ok(_) => Ok(ProgressReceipt { message_id }),
                Err(error) if is_not_modified(&error) => Ok(ProgressReceipt { message_id }),
                Err(error) => {
                    tracing::warn!(%error, peer_id, message_id, "telegram stream edit failed");
                    Err(error)
                }
            };
        }

        let sent: TelegramSentMessage = self
            .call(
                "sendMessage",
                serde_json::json!({ "chat_id": peer_id, "text": text }),
            )
            .await?;
        Ok(ProgressReceipt {
            message_id: sent.message_id,
        })
    }

    async fn send_typing(&self, peer_id: &str) -> Result<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                serde_json::json!({ "chat_id": peer_id, "action": "typing" }),
            )
            .await?;
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(
        &self,
        tx: mpsc::Sender<InboundMessage>,
        bot_username: Option<String>,
    ) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramEnvelope<Vec<TelegramUpdate>>>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion so a bad update is never replayed.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                let Some(message) = update.message.as_ref() else {
                    continue;
                };
                if let Some(inbound) =
                    build_inbound_message(message, self.groups_enabled, bot_username.as_deref())
                {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn is_not_modified(error: &anyhow::Error) -> bool {
    error
        .to_string()
        .to_lowercase()
        .contains(TELEGRAM_NOT_MODIFIED)
}

fn build_inbound_message(
    message: &TelegramMessage,
    groups_enabled: bool,
    bot_username: Option<&str>,
) -> Option<InboundMessage> {
    let chat = message.chat.as_ref()?;
    if message.from.as_ref().is_some_and(|from| from.is_bot) {
        return None;
    }
    let is_group = matches!(chat.r#type.as_str(), "group" | "supergroup" | "channel");
    if is_group && !groups_enabled {
        tracing::debug!(chat_id = chat.id, chat_type = %chat.r#type, "telegram message ignored (groups disabled)");
        return None;
    }

    let mut text = message
        .text
        .as_deref()
        .or(message.caption.as_deref())
        .unwrap_or_default()
        .to_string();
    if text.trim().is_empty() {
        return None;
    }

    if is_group {
        let Some(username) = bot_username else {
            tracing::debug!(chat_id = chat.id, "telegram message ignored (bot username unknown)");
            return None;
        };
        text = strip_mention(&text, username)?;
        if text.is_empty() {
            return None;
        }
    }

    tracing::debug!(
        chat_id = chat.id,
        chat_type = %chat.r#type,
        is_group,
        length = text.chars().count(),
        "telegram message received"
    );

    Some(
        InboundMessage::new(ChannelName::Telegram, chat.id.to_string(), text)
            .with_raw(serde_json::to_value(message).unwrap_or(serde_json::Value::Null)),
    )
}

/// Removes the first `@username` mention (case-insensitive, whole word).
/// Returns `None` when the bot was not mentioned.
fn strip_mention(text: &str, username: &str) -> Option<String> {
    for (at, _) in text.match_indices('@') {
        let start = at + 1;
        let Some(len) = prefix_len_ignore_case(&text[start..], username) else {
            continue;
        };
        let end = start + len;
        let boundary = text[end..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_'));
        if boundary {
            let mut stripped = String::with_capacity(text.len());
            stripped.push_str(&text[..at]);
            stripped.push_str(&text[end..]);
            return Some(stripped.trim().to_string());
        }
    }
    None
}

/// Byte length of the leading run of `text` matching `prefix` char by char.
fn prefix_len_ignore_case(text: &str, prefix: &str) -> Option<usize> {
    let mut chars = text.char_indices();
    for expected in prefix.chars() {
        let (_, actual) = chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
    }
    Some(chars.next().map_or(text.len(), |(idx, _)| idx))
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct TelegramEnvelope<T> {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramBotUser {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}
