//! Routes backend events to the run they belong to.

use super::coordinator::StreamCoordinators;
use super::hooks::ChannelHooksRegistry;
use super::idle::SessionIdleHandler;
use super::tool_updates::ToolUpdateNotifier;
use super::typing::TypingManager;
use crate::config::PermissionMode;
use crate::outbound::OutboundSender;
use crate::state::run_state::{ActiveRuns, SessionModels, SharedRun};
use crate::support::reporting::{BridgeReporter, report_thinking};
use anyhow::Context;
use pilot_channels::OutboundKind;
use pilot_opencode::{
    BridgeEvent, MessageInfo, MessagePartDelta, MessagePartUpdated, MessageRole, OpencodeBackend,
    PermissionAsked, PermissionReply, SessionId, SessionStatus,
};
use std::sync::Arc;

pub const PERMISSION_DENIED_NOTICE: &str = "Permission denied. Update configuration to allow tools.";

/// Everything the router touches. Shared with the inbound side.
#[derive(Clone)]
pub struct EventRouterDeps {
    pub backend: Arc<dyn OpencodeBackend>,
    pub permission_mode: PermissionMode,
    pub tool_output_limit: usize,
    pub active_runs: ActiveRuns,
    pub session_models: SessionModels,
    pub typing: Arc<TypingManager>,
    pub coordinators: StreamCoordinators,
    pub hooks: ChannelHooksRegistry,
    pub outbound: Arc<dyn OutboundSender>,
    pub reporter: Arc<dyn BridgeReporter>,
}

pub struct BridgeEventRouter {
    backend: Arc<dyn OpencodeBackend>,
    permission_mode: PermissionMode,
    active_runs: ActiveRuns,
    session_models: SessionModels,
    typing: Arc<TypingManager>,
    coordinators: StreamCoordinators,
    hooks: ChannelHooksRegistry,
    outbound: Arc<dyn OutboundSender>,
    reporter: Arc<dyn BridgeReporter>,
    tool_updates: ToolUpdateNotifier,
    idle: SessionIdleHandler,
}

impl BridgeEventRouter {
    pub fn new(deps: EventRouterDeps) -> Self {
        let idle = SessionIdleHandler {
            active_runs: deps.active_runs.clone(),
            session_models: deps.session_models.clone(),
            typing: Arc::clone(&deps.typing),
            coordinators: deps.coordinators.clone(),
            hooks: deps.hooks.clone(),
            reporter: Arc::clone(&deps.reporter),
        };
        Self {
            tool_updates: ToolUpdateNotifier::new(deps.tool_output_limit, Arc::clone(&deps.outbound)),
            idle,
            backend: deps.backend,
            permission_mode: deps.permission_mode,
            active_runs: deps.active_runs,
            session_models: deps.session_models,
            typing: deps.typing,
            coordinators: deps.coordinators,
            hooks: deps.hooks,
            outbound: deps.outbound,
            reporter: deps.reporter,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(kind = event.kind()))]
    pub async fn route(&self, event: &BridgeEvent) -> anyhow::Result<()> {
        match event {
            BridgeEvent::MessageUpdated(info) => self.on_message_updated(info),
            BridgeEvent::SessionStatus { session_id, status } => {
                self.on_session_status(session_id, status).await;
            }
            BridgeEvent::SessionIdle { session_id } => self.idle.handle(session_id).await,
            BridgeEvent::MessagePartUpdated(event) => self.on_part_updated(event).await,
            BridgeEvent::MessagePartDelta(event) => self.on_part_delta(event).await,
            BridgeEvent::PermissionAsked(request) => self.on_permission_asked(request).await?,
            BridgeEvent::Unknown { .. } => {}
        }
        Ok(())
    }

    fn run(&self, session_id: &str) -> Option<SharedRun> {
        self.active_runs
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    fn on_message_updated(&self, info: &MessageInfo) {
        let run = self.run(&info.session_id);
        if let Some(run) = &run {
            let channel = run.lock().channel;
            self.coordinators.get(channel).on_message_updated(info);
        }

        if info.role != MessageRole::User {
            return;
        }
        let Some(model) = &info.model else {
            return;
        };
        self.session_models
            .insert(info.session_id.clone(), model.clone());
        if let Some(run) = &run {
            report_thinking(&mut run.lock(), &self.session_models, self.reporter.as_ref());
        }
    }

    async fn on_session_status(&self, session_id: &SessionId, status: &SessionStatus) {
        match status {
            SessionStatus::Busy | SessionStatus::Retry => {
                let Some(run) = self.run(session_id) else {
                    return;
                };
                let (channel, peer_id) = {
                    let mut run = run.lock();
                    report_thinking(&mut run, &self.session_models, self.reporter.as_ref());
                    (run.channel, run.peer_id.clone())
                };
                self.typing.start(session_id, channel, &peer_id);
            }
            SessionStatus::Idle => self.idle.handle(session_id).await,
            SessionStatus::Other => {}
        }
    }

    async fn on_part_updated(&self, event: &MessagePartUpdated) {
        let Some(run) = self.run(&event.part.session_id) else {
            return;
        };
        let channel = run.lock().channel;
        self.coordinators.get(channel).on_part_updated(event).await;
        self.hooks.get(channel).on_part_updated(&run, &event.part).await;
        self.tool_updates.notify(&run, &event.part).await;
    }

    async fn on_part_delta(&self, event: &MessagePartDelta) {
        let Some(run) = self.run(&event.session_id) else {
            return;
        };
        let channel = run.lock().channel;
        self.coordinators.get(channel).on_part_delta(event).await;
    }

    async fn on_permission_asked(&self, request: &PermissionAsked) -> anyhow::Result<()> {
        let reply = match self.permission_mode {
            PermissionMode::Allow => PermissionReply::Always,
            PermissionMode::Deny => PermissionReply::Reject,
        };
        tracing::info!(
            session_id = %request.session_id,
            permission_id = %request.id,
            permission = request.permission.as_deref().unwrap_or_default(),
            ?reply,
            "answering permission request"
        );
        self.backend
            .respond_permission(&request.session_id, &request.id, reply)
            .await
            .with_context(|| format!("failed to answer permission {}", request.id))?;

        if reply != PermissionReply::Reject {
            return Ok(());
        }
        let Some(run) = self.run(&request.session_id) else {
            return Ok(());
        };
        let (channel, peer_id) = {
            let run = run.lock();
            (run.channel, run.peer_id.clone())
        };
        self.outbound
            .send_text(channel, &peer_id, PERMISSION_DENIED_NOTICE, OutboundKind::System)
            .await
    }
}
