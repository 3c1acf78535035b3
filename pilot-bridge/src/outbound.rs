//! Outbound text delivery to channel adapters.

use crate::support::reporting::BridgeReporter;
use crate::support::text::chunk_text;
use async_trait::async_trait;
use pilot_channels::{ChannelAdapter, ChannelName, OutboundKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Adapters keyed by channel. Built once at startup, read-only afterwards.
pub type AdapterMap = Arc<HashMap<ChannelName, Arc<dyn ChannelAdapter>>>;

/// Sends a complete message to a peer, splitting it to fit the channel.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send_text(
        &self,
        channel: ChannelName,
        peer_id: &str,
        text: &str,
        kind: OutboundKind,
    ) -> anyhow::Result<()>;
}

pub struct OutboundDispatcher {
    adapters: AdapterMap,
    reporter: Arc<dyn BridgeReporter>,
}

impl OutboundDispatcher {
    pub fn new(adapters: AdapterMap, reporter: Arc<dyn BridgeReporter>) -> Self {
        Self { adapters, reporter }
    }
}

#[async_trait]
impl OutboundSender for OutboundDispatcher {
    async fn send_text(
        &self,
        channel: ChannelName,
        peer_id: &str,
        text: &str,
        kind: OutboundKind,
    ) -> anyhow::Result<()> {
        let Some(adapter) = self.adapters.get(&channel) else {
            tracing::debug!(%channel, peer_id, "no adapter for channel; dropping outbound");
            return Ok(());
        };
        tracing::debug!(
            %channel,
            peer_id,
            kind = kind.as_str(),
            length = text.chars().count(),
            "send_text requested"
        );
        self.reporter.on_outbound(channel, peer_id, text, kind);

        for chunk in chunk_text(text, adapter.max_text_length()) {
            tracing::info!(%channel, peer_id, length = chunk.chars().count(), "sending message");
            adapter.send_text(peer_id, &chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingAdapter, RecordingReporter};

    #[tokio::test]
    async fn long_text_is_sent_in_channel_sized_chunks() {
        let adapter = Arc::new(RecordingAdapter::new(ChannelName::Slack).with_max_text_length(10));
        let reporter = Arc::new(RecordingReporter::default());
        let mut adapters: HashMap<ChannelName, Arc<dyn ChannelAdapter>> = HashMap::new();
        adapters.insert(ChannelName::Slack, adapter.clone());
        let dispatcher = OutboundDispatcher::new(Arc::new(adapters), reporter.clone());

        dispatcher
            .send_text(ChannelName::Slack, "C1", "first line\nsecond", OutboundKind::Reply)
            .await
            .unwrap();

        assert_eq!(adapter.sent_texts(), vec!["first line".to_string(), "second".to_string()]);
        assert_eq!(reporter.outbound().len(), 1);
    }

    #[tokio::test]
    async fn unknown_channel_is_a_silent_no_op() {
        let dispatcher =
            OutboundDispatcher::new(Arc::new(HashMap::new()), Arc::new(RecordingReporter::default()));
        dispatcher
            .send_text(ChannelName::Qq, "1", "hello", OutboundKind::System)
            .await
            .unwrap();
    }
}
