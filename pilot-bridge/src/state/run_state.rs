//! Per-turn run state shared between the turn executor and the event router.

use dashmap::DashMap;
use pilot_channels::ChannelName;
use pilot_opencode::{ModelRef, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLifecycle {
    pub thinking_active: bool,
    pub thinking_label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelegramRunState {
    /// Set once the reply went out as a plain send; the stream stays silent after that.
    pub streaming_suppressed: bool,
    pub thinking_notice_sent: bool,
    pub seen_reasoning_parts: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPayload {
    Generic,
    Telegram(TelegramRunState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub session_id: SessionId,
    pub channel: ChannelName,
    pub peer_id: String,
    pub tool_updates_enabled: bool,
    /// callID -> last reported tool status.
    pub seen_tool_states: HashMap<String, String>,
    pub lifecycle: RunLifecycle,
    pub payload: RunPayload,
}

impl RunState {
    pub fn new(
        session_id: SessionId,
        channel: ChannelName,
        peer_id: impl Into<String>,
        tool_updates_enabled: bool,
    ) -> Self {
        let payload = match channel {
            ChannelName::Telegram => RunPayload::Telegram(TelegramRunState::default()),
            _ => RunPayload::Generic,
        };
        Self {
            session_id,
            channel,
            peer_id: peer_id.into(),
            tool_updates_enabled,
            seen_tool_states: HashMap::new(),
            lifecycle: RunLifecycle::default(),
            payload,
        }
    }

    pub fn telegram(&self) -> Option<&TelegramRunState> {
        match &self.payload {
            RunPayload::Telegram(state) => Some(state),
            RunPayload::Generic => None,
        }
    }

    pub fn telegram_mut(&mut self) -> Option<&mut TelegramRunState> {
        match &mut self.payload {
            RunPayload::Telegram(state) => Some(state),
            RunPayload::Generic => None,
        }
    }

    pub fn is_telegram(&self) -> bool {
        self.telegram().is_some()
    }
}

/// A run shared by handle. The lock is never held across an await point.
#[derive(Debug, Clone)]
pub struct SharedRun(Arc<Mutex<RunState>>);

impl SharedRun {
    pub fn new(state: RunState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn lock(&self) -> MutexGuard<'_, RunState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> SessionId {
        self.lock().session_id.clone()
    }

    pub fn ptr_eq(&self, other: &SharedRun) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// sessionID -> in-flight run. One map per bridge instance.
pub type ActiveRuns = Arc<DashMap<SessionId, SharedRun>>;

/// sessionID -> model most recently reported for a user message.
pub type SessionModels = Arc<DashMap<SessionId, ModelRef>>;
