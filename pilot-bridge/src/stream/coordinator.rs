//! Channel stream coordinators: live-edited delivery of streamed replies.

use async_trait::async_trait;
use pilot_channels::ChannelName;
use pilot_opencode::{MessageInfo, MessagePartDelta, MessagePartUpdated, SessionId};
use std::collections::HashMap;
use std::sync::Arc;

/// Turns backend part events into outbound edits for one channel.
///
/// `finalize_reply` returns `false` when the reply could not be delivered as
/// an edit; the caller then decides whether a plain send is safe.
#[async_trait]
pub trait StreamCoordinator: Send + Sync {
    fn on_message_updated(&self, info: &MessageInfo);

    async fn on_part_delta(&self, event: &MessagePartDelta);

    async fn on_part_updated(&self, event: &MessagePartUpdated);

    async fn on_session_idle(&self, session_id: &SessionId);

    async fn finalize_reply(&self, session_id: &SessionId, peer_id: &str, text: &str) -> bool;

    fn has_streamed_message(&self, session_id: &SessionId) -> bool;

    fn clear_session(&self, session_id: &SessionId);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStreamCoordinator;

#[async_trait]
impl StreamCoordinator for NoopStreamCoordinator {
    fn on_message_updated(&self, _info: &MessageInfo) {}

    async fn on_part_delta(&self, _event: &MessagePartDelta) {}

    async fn on_part_updated(&self, _event: &MessagePartUpdated) {}

    async fn on_session_idle(&self, _session_id: &SessionId) {}

    async fn finalize_reply(&self, _session_id: &SessionId, _peer_id: &str, _text: &str) -> bool {
        false
    }

    fn has_streamed_message(&self, _session_id: &SessionId) -> bool {
        false
    }

    fn clear_session(&self, _session_id: &SessionId) {}
}

/// Coordinators keyed by channel; unknown channels get the no-op coordinator.
#[derive(Clone)]
pub struct StreamCoordinators {
    by_channel: Arc<HashMap<ChannelName, Arc<dyn StreamCoordinator>>>,
    fallback: Arc<dyn StreamCoordinator>,
}

impl Default for StreamCoordinators {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl StreamCoordinators {
    pub fn new(by_channel: HashMap<ChannelName, Arc<dyn StreamCoordinator>>) -> Self {
        Self {
            by_channel: Arc::new(by_channel),
            fallback: Arc::new(NoopStreamCoordinator),
        }
    }

    pub fn get(&self, channel: ChannelName) -> Arc<dyn StreamCoordinator> {
        self.by_channel
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}
