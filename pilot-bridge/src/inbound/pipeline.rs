//! Inbound entry point: dedup, access, commands, session resolution and
//! per-session enqueueing of the turn.

use super::access_control::AccessControlService;
use super::access_identity::resolve_access_identity;
use super::commands::{CommandContext, handle_command};
use super::deduper::TelegramInboundDeduper;
use super::run_execution::{RunExecutionService, RunInput};
use super::session_binding::SessionBindingService;
use crate::outbound::{AdapterMap, OutboundSender};
use crate::state::model_store::ModelStore;
use crate::state::run_registry::SessionRunRegistry;
use crate::store::BridgeStore;
use crate::support::reporting::BridgeReporter;
use crate::support::text::truncate_text;
use pilot_channels::{InboundMessage, OutboundKind};
use pilot_opencode::ModelRef;
use std::sync::Arc;

const PREVIEW_LENGTH: usize = 120;

pub struct InboundPipeline {
    pub(crate) adapters: AdapterMap,
    pub(crate) store: Arc<BridgeStore>,
    pub(crate) models: Arc<ModelStore>,
    pub(crate) default_model: Option<ModelRef>,
    pub(crate) registry: Arc<SessionRunRegistry>,
    pub(crate) access: AccessControlService,
    pub(crate) bindings: Arc<SessionBindingService>,
    pub(crate) runs: Arc<RunExecutionService>,
    pub(crate) deduper: TelegramInboundDeduper,
    pub(crate) outbound: Arc<dyn OutboundSender>,
    pub(crate) reporter: Arc<dyn BridgeReporter>,
}

impl InboundPipeline {
    /// Takes one inbound message as far as enqueueing its turn. Returns once
    /// the turn is queued, not when it completes.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %message.channel, peer_id = %message.peer_id)
    )]
    pub async fn handle_inbound(&self, message: InboundMessage) -> anyhow::Result<()> {
        if !self.adapters.contains_key(&message.channel) {
            tracing::debug!("no adapter for inbound channel; ignoring");
            return Ok(());
        }
        if self.deduper.is_duplicate(&message) {
            tracing::debug!("duplicate telegram inbound ignored");
            return Ok(());
        }

        tracing::debug!(
            from_me = message.from_me,
            length = message.text.chars().count(),
            preview = %truncate_text(message.text.trim(), PREVIEW_LENGTH),
            "inbound received"
        );

        let identity = resolve_access_identity(&message);
        let decision = self.access.allow_inbound(&message, &identity).await?;
        if !decision.is_allowed() {
            tracing::info!(access_key = %identity.access_key, ?decision, "inbound denied");
            return Ok(());
        }

        let trimmed = message.text.trim();
        if trimmed.starts_with('/') {
            let ctx = CommandContext {
                store: &self.store,
                models: &self.models,
                default_model: self.default_model.as_ref(),
                channel: message.channel,
                peer_key: &identity.session_key,
            };
            if let Some(reply) = handle_command(&ctx, trimmed)? {
                self.outbound
                    .send_text(message.channel, &message.peer_id, &reply, OutboundKind::System)
                    .await?;
                return Ok(());
            }
        }

        self.reporter
            .on_inbound(message.channel, &message.peer_id, &message.text, message.from_me);

        let resolved = self
            .bindings
            .resolve_session(&message, &identity.session_key)
            .await?;

        let runs = Arc::clone(&self.runs);
        let input = RunInput {
            message,
            peer_key: identity.session_key,
            session_id: resolved.session_id.clone(),
        };
        self.registry.enqueue(resolved.session_id, async move {
            runs.execute(input).await;
            Ok(())
        });
        Ok(())
    }

    /// Like [`handle_inbound`](Self::handle_inbound), then waits for the
    /// peer's queued turns to finish.
    pub async fn dispatch_inbound(&self, message: InboundMessage) -> anyhow::Result<()> {
        let identity = resolve_access_identity(&message);
        let channel = message.channel;
        self.handle_inbound(message).await?;

        let Some(session) = self.store.get_session(channel, &identity.session_key)? else {
            return Ok(());
        };
        if let Some(pending) = self.registry.pending_task(&session.session_id) {
            pending.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, PermissionMode};
    use crate::inbound::prompt_execution::PromptExecutionService;
    use crate::inbound::session_factory::SessionFactory;
    use crate::state::run_state::{ActiveRuns, SessionModels};
    use crate::stream::coordinator::StreamCoordinators;
    use crate::stream::typing::TypingManager;
    use crate::testing::{RecordingAdapter, RecordingOutbound, RecordingReporter, ScriptedBackend};
    use pilot_channels::{ChannelAdapter, ChannelName};
    use pilot_opencode::{PromptResponse, SessionId};
    use serde_json::json;
    use std::collections::HashMap;

    struct Fixture {
        backend: Arc<ScriptedBackend>,
        store: Arc<BridgeStore>,
        outbound: Arc<RecordingOutbound>,
        reporter: Arc<RecordingReporter>,
        pipeline: InboundPipeline,
    }

    fn fixture(config: &str) -> Fixture {
        let config = Arc::new(BridgeConfig::from_toml_str(config).unwrap());
        let backend = Arc::new(ScriptedBackend::default());
        let store = Arc::new(BridgeStore::open_in_memory().unwrap());
        let outbound = Arc::new(RecordingOutbound::default());
        let reporter = Arc::new(RecordingReporter::default());
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(RecordingAdapter::new(ChannelName::Telegram));
        let adapters: AdapterMap = Arc::new(HashMap::from([(ChannelName::Telegram, adapter)]));
        let registry = Arc::new(SessionRunRegistry::new(ActiveRuns::default()));
        let models = Arc::new(ModelStore::new());
        let factory = Arc::new(SessionFactory::new(
            backend.clone(),
            store.clone(),
            outbound.clone(),
            reporter.clone(),
            PermissionMode::Allow,
        ));
        let bindings = Arc::new(SessionBindingService::new(
            store.clone(),
            factory.clone(),
            registry.clone(),
            Arc::new(TypingManager::new(Arc::new(HashMap::new()))),
            StreamCoordinators::default(),
            SessionModels::default(),
            reporter.clone(),
            false,
        ));
        let runs = Arc::new(RunExecutionService::new(
            models.clone(),
            None,
            PromptExecutionService::new(backend.clone(), store.clone(), factory),
            bindings.clone(),
            StreamCoordinators::default(),
            outbound.clone(),
        ));
        let pipeline = InboundPipeline {
            adapters,
            store: store.clone(),
            models,
            default_model: None,
            registry,
            access: AccessControlService::new(config, store.clone(), outbound.clone()),
            bindings,
            runs,
            deduper: TelegramInboundDeduper::default(),
            outbound: outbound.clone(),
            reporter: reporter.clone(),
        };
        Fixture {
            backend,
            store,
            outbound,
            reporter,
            pipeline,
        }
    }

    fn telegram(text: &str) -> InboundMessage {
        InboundMessage::new(ChannelName::Telegram, "42", text)
    }

    #[tokio::test]
    async fn dispatch_waits_for_the_turn_to_finish() {
        let fx = fixture("");
        fx.backend.push_prompt(Ok(PromptResponse::from_text("hi!")));

        fx.pipeline.dispatch_inbound(telegram("hello")).await.unwrap();

        assert_eq!(
            fx.outbound.texts(),
            vec!["\u{1F9ED} Session started.".to_string(), "hi!".to_string()]
        );
        assert_eq!(fx.backend.prompt_texts(), vec!["hello".to_string()]);
        assert_eq!(
            fx.reporter.inbound(),
            vec![(ChannelName::Telegram, "42".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn second_message_reuses_the_stored_session() {
        let fx = fixture("");
        fx.pipeline.dispatch_inbound(telegram("one")).await.unwrap();
        fx.pipeline.dispatch_inbound(telegram("two")).await.unwrap();

        assert_eq!(fx.backend.created_sessions(), vec![SessionId::new("ses_1")]);
        assert_eq!(
            fx.backend.prompt_calls(),
            vec![SessionId::new("ses_1"), SessionId::new("ses_1")]
        );
    }

    #[tokio::test]
    async fn denied_peers_never_reach_the_backend() {
        let fx = fixture("[channels.telegram]\naccess_policy = \"allowlist\"\n");

        fx.pipeline.dispatch_inbound(telegram("hello")).await.unwrap();

        assert!(fx.backend.create_requests().is_empty());
        assert!(fx.backend.prompt_calls().is_empty());
        assert!(fx.reporter.inbound().is_empty());
        assert_eq!(fx.outbound.sent().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_telegram_updates_run_once() {
        let fx = fixture("");
        let update = telegram("hello").with_raw(json!({ "message_id": 7, "chat": { "id": 42 } }));

        fx.pipeline.dispatch_inbound(update.clone()).await.unwrap();
        fx.pipeline.dispatch_inbound(update).await.unwrap();

        assert_eq!(fx.backend.prompt_calls().len(), 1);
    }

    #[tokio::test]
    async fn channels_without_an_adapter_are_ignored() {
        let fx = fixture("");

        fx.pipeline
            .dispatch_inbound(InboundMessage::new(ChannelName::Slack, "U1", "hello"))
            .await
            .unwrap();

        assert!(fx.backend.create_requests().is_empty());
        assert!(fx.outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn recognized_commands_short_circuit_the_turn() {
        let fx = fixture("");
        fx.pipeline.dispatch_inbound(telegram("hello")).await.unwrap();
        assert!(fx.store.get_session(ChannelName::Telegram, "42").unwrap().is_some());

        fx.pipeline.dispatch_inbound(telegram("  /reset ")).await.unwrap();

        assert!(fx.store.get_session(ChannelName::Telegram, "42").unwrap().is_none());
        assert_eq!(fx.backend.prompt_calls().len(), 1);
        let last = fx.outbound.sent().pop().unwrap();
        assert_eq!(last.kind, OutboundKind::System);
        assert_eq!(last.text, "Session and model reset. Send a message to start fresh.");
    }

    #[tokio::test]
    async fn model_presets_apply_to_later_prompts() {
        let fx = fixture("");

        fx.pipeline.dispatch_inbound(telegram("/codex")).await.unwrap();
        fx.pipeline.dispatch_inbound(telegram("hello")).await.unwrap();

        let requests = fx.backend.prompt_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].model.as_ref().map(ToString::to_string).as_deref(),
            Some("openai/gpt-5.2-codex")
        );
    }

    #[tokio::test]
    async fn unknown_commands_are_prompted_as_text() {
        let fx = fixture("");

        fx.pipeline.dispatch_inbound(telegram("/weather")).await.unwrap();

        assert_eq!(fx.backend.prompt_texts(), vec!["/weather".to_string()]);
    }
}
