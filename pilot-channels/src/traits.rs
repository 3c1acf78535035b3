use crate::types::{AdapterCapabilities, ChannelName, InboundMessage, ProgressReceipt};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> ChannelName;

    /// Longest text a single platform message may carry, in characters.
    fn max_text_length(&self) -> usize;

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, peer_id: &str, text: &str) -> Result<()>;

    /// Send a new message, or edit `message_id` in place when given.
    /// Adapters without progressive edits should keep the default.
    async fn send_text_progress(
        &self,
        _peer_id: &str,
        _text: &str,
        _message_id: Option<i64>,
    ) -> Result<ProgressReceipt> {
        Err(anyhow::anyhow!(
            "send_text_progress is not supported by this channel"
        ))
    }

    async fn send_typing(&self, _peer_id: &str) -> Result<()> {
        Err(anyhow::anyhow!("send_typing is not supported by this channel"))
    }
}
