//! One full turn: prompt, reply delivery and guaranteed cleanup.

use super::backend_errors::{build_error_message, normalize};
use super::prompt_execution::{PromptExecutionService, PromptInput};
use super::session_binding::{SessionBindingService, SessionRunBinding};
use crate::outbound::OutboundSender;
use crate::state::model_store::ModelStore;
use crate::state::run_state::SharedRun;
use crate::stream::coordinator::StreamCoordinators;
use pilot_channels::{InboundMessage, OutboundKind};
use pilot_opencode::{ModelRef, SessionId};
use std::sync::Arc;

pub const EMPTY_REPLY_NOTICE: &str = "No response generated. Try again.";

#[derive(Debug, Clone)]
pub struct RunInput {
    pub message: InboundMessage,
    pub peer_key: String,
    pub session_id: SessionId,
}

pub struct RunExecutionService {
    models: Arc<ModelStore>,
    default_model: Option<ModelRef>,
    prompts: PromptExecutionService,
    bindings: Arc<SessionBindingService>,
    coordinators: StreamCoordinators,
    outbound: Arc<dyn OutboundSender>,
}

impl RunExecutionService {
    pub fn new(
        models: Arc<ModelStore>,
        default_model: Option<ModelRef>,
        prompts: PromptExecutionService,
        bindings: Arc<SessionBindingService>,
        coordinators: StreamCoordinators,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            models,
            default_model,
            prompts,
            bindings,
            coordinators,
            outbound,
        }
    }

    /// Runs the turn. Failures are reported to the peer as a system notice;
    /// the run binding is released whatever happens.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %input.message.channel, session_id = %input.session_id)
    )]
    pub async fn execute(&self, input: RunInput) {
        let mut binding = self
            .bindings
            .create_run_binding(&input.message, input.session_id.clone());
        binding.initialize();

        if let Err(error) = self.run_turn(&input, &mut binding).await {
            let normalized = normalize(&error);
            tracing::error!(
                session_id = %binding.current_session_id(),
                error = %format!("{error:#}"),
                name = normalized.as_ref().and_then(|e| e.name.as_deref()),
                status = normalized.as_ref().and_then(|e| e.status),
                code = normalized.as_ref().and_then(|e| e.code.as_deref()),
                "prompt failed"
            );
            let notice = build_error_message(&error);
            let message = &input.message;
            if let Err(send_error) = self
                .outbound
                .send_text(message.channel, &message.peer_id, &notice, OutboundKind::System)
                .await
            {
                tracing::warn!(error = %send_error, "failed to deliver error notice");
            }
        }

        binding.finalize();
    }

    async fn run_turn(
        &self,
        input: &RunInput,
        binding: &mut SessionRunBinding<'_>,
    ) -> anyhow::Result<()> {
        let message = &input.message;
        let model = self
            .models
            .get(message.channel, &input.peer_key, self.default_model.as_ref());
        tracing::debug!(
            session_id = %binding.current_session_id(),
            length = message.text.chars().count(),
            model = model.as_ref().map(ToString::to_string),
            "prompt start"
        );

        let prompt = PromptInput {
            channel: message.channel,
            peer_id: &message.peer_id,
            peer_key: &input.peer_key,
            text: &message.text,
            session_id: binding.current_session_id().clone(),
            model,
        };
        let outcome = self
            .prompts
            .prompt_with_session_recovery(prompt, |recovery| {
                tracing::info!(
                    old_session_id = %recovery.previous,
                    new_session_id = %recovery.next,
                    "session recovered and active run rebound"
                );
                binding.rebind(&recovery.next);
            })
            .await?;

        if outcome.session_id != *binding.current_session_id() {
            tracing::info!(
                old_session_id = %binding.current_session_id(),
                new_session_id = %outcome.session_id,
                "active run session mismatch detected, rebinding"
            );
            binding.rebind(&outcome.session_id);
        }

        let parts = &outcome.response.parts;
        tracing::debug!(
            session_id = %outcome.session_id,
            part_count = parts.len(),
            part_types = ?parts.iter().map(|part| part.kind.type_name()).collect::<Vec<_>>(),
            "prompt response"
        );

        let reply = outcome.response.reply_text();
        if reply.is_empty() {
            tracing::debug!(session_id = %outcome.session_id, "reply empty");
            return self
                .outbound
                .send_text(message.channel, &message.peer_id, EMPTY_REPLY_NOTICE, OutboundKind::System)
                .await;
        }
        self.deliver_reply(binding.run(), &message.peer_id, &reply).await
    }

    /// Prefers closing the streamed message with the final text. Falls back to
    /// a plain send only when nothing was ever streamed, so a partially shown
    /// reply is never duplicated.
    async fn deliver_reply(&self, run: &SharedRun, peer_id: &str, reply: &str) -> anyhow::Result<()> {
        let (channel, session_id) = {
            let run = run.lock();
            (run.channel, run.session_id.clone())
        };
        let coordinator = self.coordinators.get(channel);

        let streamed_before = coordinator.has_streamed_message(&session_id);
        if coordinator.finalize_reply(&session_id, peer_id, reply).await {
            tracing::debug!(
                session_id = %session_id,
                reply_length = reply.chars().count(),
                "reply finalized by stream coordinator"
            );
            return Ok(());
        }
        if streamed_before || coordinator.has_streamed_message(&session_id) {
            tracing::warn!(
                session_id = %session_id,
                reply_length = reply.chars().count(),
                "stream finalization failed; skipping fallback send to avoid a duplicate message"
            );
            return Ok(());
        }

        {
            let mut run = run.lock();
            if let Some(telegram) = run.telegram_mut() {
                telegram.streaming_suppressed = true;
            }
        }
        tracing::debug!(
            session_id = %session_id,
            reply_length = reply.chars().count(),
            "sending reply"
        );
        self.outbound
            .send_text(channel, peer_id, reply, OutboundKind::Reply)
            .await
    }
}
