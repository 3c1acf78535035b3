//! In-process doubles for adapters, the backend and outbound delivery.

use crate::outbound::OutboundSender;
use crate::stream::coordinator::StreamCoordinator;
use crate::support::reporting::BridgeReporter;
use async_trait::async_trait;
use futures_util::StreamExt;
use pilot_channels::{
    AdapterCapabilities, ChannelAdapter, ChannelName, InboundMessage, OutboundKind,
    ProgressReceipt,
};
use pilot_opencode::{
    BackendEventStream, BridgeEvent, CreateSessionRequest, MessageInfo, MessagePartDelta,
    MessagePartUpdated, OpencodeBackend, OpencodeError, PermissionReply, PromptRequest,
    PromptResponse, SessionId, SessionInfo,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct RecordingReporter {
    statuses: Mutex<Vec<String>>,
    inbound: Mutex<Vec<(ChannelName, String, String)>>,
    outbound: Mutex<Vec<(ChannelName, String, String, OutboundKind)>>,
}

impl RecordingReporter {
    pub fn statuses(&self) -> Vec<String> {
        locked(&self.statuses).clone()
    }

    pub fn inbound(&self) -> Vec<(ChannelName, String, String)> {
        locked(&self.inbound).clone()
    }

    pub fn outbound(&self) -> Vec<(ChannelName, String, String, OutboundKind)> {
        locked(&self.outbound).clone()
    }
}

impl BridgeReporter for RecordingReporter {
    fn on_status(&self, message: &str) {
        locked(&self.statuses).push(message.to_string());
    }

    fn on_inbound(&self, channel: ChannelName, peer_id: &str, text: &str, _from_me: bool) {
        locked(&self.inbound).push((channel, peer_id.to_string(), text.to_string()));
    }

    fn on_outbound(&self, channel: ChannelName, peer_id: &str, text: &str, kind: OutboundKind) {
        locked(&self.outbound).push((channel, peer_id.to_string(), text.to_string(), kind));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Text {
        peer_id: String,
        text: String,
    },
    Progress {
        peer_id: String,
        text: String,
        message_id: Option<i64>,
    },
    Typing {
        peer_id: String,
    },
}

impl AdapterCall {
    pub fn progress(peer_id: &str, text: &str, message_id: Option<i64>) -> Self {
        Self::Progress {
            peer_id: peer_id.to_string(),
            text: text.to_string(),
            message_id,
        }
    }
}

/// Adapter that records every call. Progressive edits hand out increasing
/// message ids starting at 100.
pub struct RecordingAdapter {
    channel: ChannelName,
    max_text_length: usize,
    capabilities: AdapterCapabilities,
    calls: Mutex<Vec<AdapterCall>>,
    next_message_id: AtomicI64,
    last_message_id: Mutex<Option<i64>>,
    fail_progress: AtomicBool,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    stopped: AtomicBool,
}

impl RecordingAdapter {
    pub fn new(channel: ChannelName) -> Self {
        Self {
            channel,
            max_text_length: 4096,
            capabilities: AdapterCapabilities {
                progress: true,
                typing: true,
                file: false,
            },
            calls: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(100),
            last_message_id: Mutex::new(None),
            fail_progress: AtomicBool::new(false),
            inbound: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_max_text_length(mut self, max_text_length: usize) -> Self {
        self.max_text_length = max_text_length;
        self
    }

    pub fn without_typing(mut self) -> Self {
        self.capabilities.typing = false;
        self
    }

    pub fn fail_progress(&self, fail: bool) {
        self.fail_progress.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        locked(&self.calls).clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AdapterCall::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn progress_calls(&self) -> Vec<AdapterCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, AdapterCall::Progress { .. }))
            .collect()
    }

    pub fn typing_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AdapterCall::Typing { .. }))
            .count()
    }

    pub fn last_message_id(&self) -> Option<i64> {
        *locked(&self.last_message_id)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn receive(&self, message: InboundMessage) {
        let tx = locked(&self.inbound).clone();
        if let Some(tx) = tx {
            tx.send(message).await.unwrap();
        }
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel(&self) -> ChannelName {
        self.channel
    }

    fn max_text_length(&self) -> usize {
        self.max_text_length
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
        *locked(&self.inbound) = Some(tx);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        locked(&self.inbound).take();
        Ok(())
    }

    async fn send_text(&self, peer_id: &str, text: &str) -> anyhow::Result<()> {
        locked(&self.calls).push(AdapterCall::Text {
            peer_id: peer_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_text_progress(
        &self,
        peer_id: &str,
        text: &str,
        message_id: Option<i64>,
    ) -> anyhow::Result<ProgressReceipt> {
        if self.fail_progress.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("progress delivery failed"));
        }
        locked(&self.calls).push(AdapterCall::progress(peer_id, text, message_id));
        let message_id = message_id
            .unwrap_or_else(|| self.next_message_id.fetch_add(1, Ordering::SeqCst));
        *locked(&self.last_message_id) = Some(message_id);
        Ok(ProgressReceipt { message_id })
    }

    async fn send_typing(&self, peer_id: &str) -> anyhow::Result<()> {
        locked(&self.calls).push(AdapterCall::Typing {
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub channel: ChannelName,
    pub peer_id: String,
    pub text: String,
    pub kind: OutboundKind,
}

#[derive(Default)]
pub struct RecordingOutbound {
    sent: Mutex<Vec<SentText>>,
}

impl RecordingOutbound {
    pub fn sent(&self) -> Vec<SentText> {
        locked(&self.sent).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|sent| sent.text).collect()
    }
}

#[async_trait]
impl OutboundSender for RecordingOutbound {
    async fn send_text(
        &self,
        channel: ChannelName,
        peer_id: &str,
        text: &str,
        kind: OutboundKind,
    ) -> anyhow::Result<()> {
        locked(&self.sent).push(SentText {
            channel,
            peer_id: peer_id.to_string(),
            text: text.to_string(),
            kind,
        });
        Ok(())
    }
}

/// Coordinator that streams nothing and records cleared sessions and
/// finalize requests. Finalize outcome and streamed state are scripted.
#[derive(Default)]
pub struct RecordingCoordinator {
    cleared: Mutex<Vec<SessionId>>,
    finalized: Mutex<Vec<(SessionId, String)>>,
    finalize_result: AtomicBool,
    streamed: AtomicBool,
}

impl RecordingCoordinator {
    pub fn finalizing(self, result: bool) -> Self {
        self.finalize_result.store(result, Ordering::SeqCst);
        self
    }

    pub fn streamed(self, streamed: bool) -> Self {
        self.streamed.store(streamed, Ordering::SeqCst);
        self
    }

    pub fn cleared(&self) -> Vec<SessionId> {
        locked(&self.cleared).clone()
    }

    pub fn finalized(&self) -> Vec<(SessionId, String)> {
        locked(&self.finalized).clone()
    }
}

#[async_trait]
impl StreamCoordinator for RecordingCoordinator {
    fn on_message_updated(&self, _info: &MessageInfo) {}

    async fn on_part_delta(&self, _event: &MessagePartDelta) {}

    async fn on_part_updated(&self, _event: &MessagePartUpdated) {}

    async fn on_session_idle(&self, _session_id: &SessionId) {}

    async fn finalize_reply(&self, session_id: &SessionId, _peer_id: &str, text: &str) -> bool {
        locked(&self.finalized).push((session_id.clone(), text.to_string()));
        self.finalize_result.load(Ordering::SeqCst)
    }

    fn has_streamed_message(&self, _session_id: &SessionId) -> bool {
        self.streamed.load(Ordering::SeqCst)
    }

    fn clear_session(&self, session_id: &SessionId) {
        locked(&self.cleared).push(session_id.clone());
    }
}

/// Scripted OpenCode backend.
///
/// Prompts pop queued results (an empty queue answers "ok"). Sessions are
/// numbered `ses_1`, `ses_2`, ... Each `subscribe_events` call replays the
/// next queued batch, then the live stream once the batches run out, and
/// fails when neither is left.
pub struct ScriptedBackend {
    prompts: Mutex<VecDeque<Result<PromptResponse, OpencodeError>>>,
    prompt_calls: Mutex<Vec<(SessionId, PromptRequest)>>,
    prompt_delay: Mutex<Option<Duration>>,
    during_prompt: Mutex<VecDeque<Vec<BridgeEvent>>>,
    create_requests: Mutex<Vec<CreateSessionRequest>>,
    created: Mutex<Vec<SessionId>>,
    next_session: AtomicUsize,
    permission_replies: Mutex<Vec<(SessionId, String, PermissionReply)>>,
    event_batches: Mutex<VecDeque<Vec<BridgeEvent>>>,
    live_tx: mpsc::UnboundedSender<BridgeEvent>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<BridgeEvent>>>,
    live_enabled: AtomicBool,
    subscribe_count: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        Self {
            prompts: Mutex::new(VecDeque::new()),
            prompt_calls: Mutex::new(Vec::new()),
            prompt_delay: Mutex::new(None),
            during_prompt: Mutex::new(VecDeque::new()),
            create_requests: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            next_session: AtomicUsize::new(1),
            permission_replies: Mutex::new(Vec::new()),
            event_batches: Mutex::new(VecDeque::new()),
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
            live_enabled: AtomicBool::new(false),
            subscribe_count: AtomicUsize::new(0),
        }
    }
}

impl ScriptedBackend {
    /// Serves events pushed with [`emit_during_prompt`](Self::emit_during_prompt)
    /// through an open-ended subscription.
    pub fn with_live_events(self) -> Self {
        self.live_enabled.store(true, Ordering::SeqCst);
        self
    }

    pub fn push_prompt(&self, result: Result<PromptResponse, OpencodeError>) {
        locked(&self.prompts).push_back(result);
    }

    /// Events published on the live stream while the next prompt is in flight.
    pub fn emit_during_prompt(&self, events: Vec<BridgeEvent>) {
        locked(&self.during_prompt).push_back(events);
    }

    pub fn set_prompt_delay(&self, delay: Duration) {
        *locked(&self.prompt_delay) = Some(delay);
    }

    pub fn push_event_batch(&self, events: Vec<BridgeEvent>) {
        locked(&self.event_batches).push_back(events);
    }

    pub fn prompt_calls(&self) -> Vec<SessionId> {
        locked(&self.prompt_calls)
            .iter()
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    pub fn prompt_texts(&self) -> Vec<String> {
        locked(&self.prompt_calls)
            .iter()
            .flat_map(|(_, request)| request.parts.iter().map(|part| part.text.clone()))
            .collect()
    }

    pub fn prompt_requests(&self) -> Vec<PromptRequest> {
        locked(&self.prompt_calls)
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn create_requests(&self) -> Vec<CreateSessionRequest> {
        locked(&self.create_requests).clone()
    }

    pub fn created_sessions(&self) -> Vec<SessionId> {
        locked(&self.created).clone()
    }

    pub fn permission_replies(&self) -> Vec<(SessionId, String, PermissionReply)> {
        locked(&self.permission_replies).clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OpencodeBackend for ScriptedBackend {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> pilot_opencode::Result<SessionInfo> {
        let id = SessionId::new(format!(
            "ses_{}",
            self.next_session.fetch_add(1, Ordering::SeqCst)
        ));
        locked(&self.create_requests).push(request.clone());
        locked(&self.created).push(id.clone());
        Ok(SessionInfo { id })
    }

    async fn prompt(
        &self,
        session_id: &SessionId,
        request: &PromptRequest,
    ) -> pilot_opencode::Result<PromptResponse> {
        locked(&self.prompt_calls).push((session_id.clone(), request.clone()));
        let events = locked(&self.during_prompt).pop_front().unwrap_or_default();
        for event in events {
            let _ = self.live_tx.send(event);
        }
        let delay = *locked(&self.prompt_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        locked(&self.prompts)
            .pop_front()
            .unwrap_or_else(|| Ok(PromptResponse::from_text("ok")))
    }

    async fn respond_permission(
        &self,
        session_id: &SessionId,
        permission_id: &str,
        reply: PermissionReply,
    ) -> pilot_opencode::Result<()> {
        locked(&self.permission_replies).push((
            session_id.clone(),
            permission_id.to_string(),
            reply,
        ));
        Ok(())
    }

    async fn subscribe_events(&self) -> pilot_opencode::Result<BackendEventStream> {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        if let Some(batch) = locked(&self.event_batches).pop_front() {
            return Ok(futures_util::stream::iter(batch.into_iter().map(Ok)).boxed());
        }
        let live = if self.live_enabled.load(Ordering::SeqCst) {
            locked(&self.live_rx).take()
        } else {
            None
        };
        match live {
            Some(rx) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (Ok(event), rx))
            })
            .boxed()),
            None => Err(OpencodeError::Transport {
                message: "event stream unavailable".to_string(),
                code: None,
            }),
        }
    }
}
