//! Durable session lookup and the live bindings of an in-flight run.

use super::session_factory::{SessionFactory, SessionReason};
use crate::state::run_registry::SessionRunRegistry;
use crate::state::run_state::{RunState, SessionModels, SharedRun};
use crate::store::BridgeStore;
use crate::stream::coordinator::StreamCoordinators;
use crate::stream::typing::TypingManager;
use crate::support::reporting::{BridgeReporter, report_done, report_thinking};
use pilot_channels::{ChannelName, InboundMessage};
use pilot_opencode::SessionId;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub session_id: SessionId,
    pub reused: bool,
}

/// Sole owner of the registry, typing and stream state tied to a run.
pub struct SessionBindingService {
    store: Arc<BridgeStore>,
    factory: Arc<SessionFactory>,
    registry: Arc<SessionRunRegistry>,
    typing: Arc<TypingManager>,
    coordinators: StreamCoordinators,
    session_models: SessionModels,
    reporter: Arc<dyn BridgeReporter>,
    tool_updates_enabled: bool,
}

impl SessionBindingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<BridgeStore>,
        factory: Arc<SessionFactory>,
        registry: Arc<SessionRunRegistry>,
        typing: Arc<TypingManager>,
        coordinators: StreamCoordinators,
        session_models: SessionModels,
        reporter: Arc<dyn BridgeReporter>,
        tool_updates_enabled: bool,
    ) -> Self {
        Self {
            store,
            factory,
            registry,
            typing,
            coordinators,
            session_models,
            reporter,
            tool_updates_enabled,
        }
    }

    /// The peer's stored session, or a freshly created (and announced) one.
    pub async fn resolve_session(
        &self,
        message: &InboundMessage,
        session_key: &str,
    ) -> anyhow::Result<ResolvedSession> {
        let stored = self.store.get_session(message.channel, session_key)?;
        let resolved = match stored {
            Some(record) => ResolvedSession {
                session_id: record.session_id,
                reused: true,
            },
            None => ResolvedSession {
                session_id: self
                    .factory
                    .create(message.channel, session_key, true, SessionReason::Initial)
                    .await?,
                reused: false,
            },
        };
        tracing::debug!(
            session_id = %resolved.session_id,
            channel = %message.channel,
            peer_id = %message.peer_id,
            reused = resolved.reused,
            "session resolved"
        );
        Ok(resolved)
    }

    pub fn create_run_binding(
        &self,
        message: &InboundMessage,
        session_id: SessionId,
    ) -> SessionRunBinding<'_> {
        let run = SharedRun::new(RunState::new(
            session_id.clone(),
            message.channel,
            message.peer_id.clone(),
            self.tool_updates_enabled,
        ));
        SessionRunBinding {
            service: self,
            channel: message.channel,
            peer_id: message.peer_id.clone(),
            run,
            original: session_id.clone(),
            current: session_id,
        }
    }

    fn release(&self, channel: ChannelName, session_id: &SessionId) {
        self.typing.stop(session_id);
        self.coordinators.get(channel).clear_session(session_id);
        self.registry.delete(session_id);
    }

    fn announce(&self, run: &SharedRun, session_id: &SessionId, channel: ChannelName, peer_id: &str) {
        self.registry.set(run.clone());
        report_thinking(&mut run.lock(), &self.session_models, self.reporter.as_ref());
        self.typing.start(session_id, channel, peer_id);
    }
}

/// A run bound to its session. Dropping the binding releases everything it
/// registered, under both the current and the originally resolved id.
pub struct SessionRunBinding<'a> {
    service: &'a SessionBindingService,
    channel: ChannelName,
    peer_id: String,
    run: SharedRun,
    original: SessionId,
    current: SessionId,
}

impl SessionRunBinding<'_> {
    pub fn current_session_id(&self) -> &SessionId {
        &self.current
    }

    pub fn run(&self) -> &SharedRun {
        &self.run
    }

    pub fn initialize(&self) {
        self.service
            .announce(&self.run, &self.current, self.channel, &self.peer_id);
    }

    /// Moves the run to `next`, tearing down everything held under the
    /// current id first.
    pub fn rebind(&mut self, next: &SessionId) {
        if next.as_str().is_empty() || *next == self.current {
            return;
        }
        self.service.release(self.channel, &self.current);
        self.current = next.clone();
        self.run.lock().session_id = next.clone();
        self.service
            .announce(&self.run, &self.current, self.channel, &self.peer_id);
    }

    pub fn finalize(self) {
        drop(self);
    }
}

impl Drop for SessionRunBinding<'_> {
    fn drop(&mut self) {
        let service = self.service;
        service.typing.stop(&self.current);
        service.coordinators.get(self.channel).clear_session(&self.current);
        report_done(&mut self.run.lock(), &service.session_models, service.reporter.as_ref());
        service.registry.delete(&self.current);

        if self.original != self.current {
            service.release(self.channel, &self.original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PermissionMode;
    use crate::outbound::AdapterMap;
    use crate::state::run_state::ActiveRuns;
    use crate::stream::coordinator::StreamCoordinator;
    use crate::testing::{
        RecordingAdapter, RecordingCoordinator, RecordingOutbound, RecordingReporter,
        ScriptedBackend,
    };
    use pilot_channels::ChannelAdapter;
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<BridgeStore>,
        backend: Arc<ScriptedBackend>,
        registry: Arc<SessionRunRegistry>,
        typing: Arc<TypingManager>,
        coordinator: Arc<RecordingCoordinator>,
        reporter: Arc<RecordingReporter>,
        service: SessionBindingService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(BridgeStore::open_in_memory().unwrap());
        let backend = Arc::new(ScriptedBackend::default());
        let reporter = Arc::new(RecordingReporter::default());
        let adapter: Arc<dyn ChannelAdapter> = Arc::new(RecordingAdapter::new(ChannelName::Telegram));
        let adapters: AdapterMap = Arc::new(HashMap::from([(ChannelName::Telegram, adapter)]));
        let registry = Arc::new(SessionRunRegistry::new(ActiveRuns::default()));
        let typing = Arc::new(TypingManager::new(adapters));
        let coordinator = Arc::new(RecordingCoordinator::default());
        let factory = Arc::new(SessionFactory::new(
            backend.clone(),
            store.clone(),
            Arc::new(RecordingOutbound::default()),
            reporter.clone(),
            PermissionMode::Allow,
        ));
        let service = SessionBindingService::new(
            store.clone(),
            factory,
            registry.clone(),
            typing.clone(),
            StreamCoordinators::new(HashMap::from([(
                ChannelName::Telegram,
                coordinator.clone() as Arc<dyn StreamCoordinator>,
            )])),
            SessionModels::default(),
            reporter.clone(),
            false,
        );
        Fixture {
            store,
            backend,
            registry,
            typing,
            coordinator,
            reporter,
            service,
        }
    }

    fn message() -> InboundMessage {
        InboundMessage::new(ChannelName::Telegram, "42", "hello")
    }

    #[tokio::test]
    async fn resolve_reuses_stored_sessions_and_creates_missing_ones() {
        let fx = fixture();
        let created = fx.service.resolve_session(&message(), "42").await.unwrap();
        assert!(!created.reused);
        assert_eq!(fx.backend.create_requests().len(), 1);

        let reused = fx.service.resolve_session(&message(), "42").await.unwrap();
        assert!(reused.reused);
        assert_eq!(reused.session_id, created.session_id);
        assert_eq!(fx.backend.create_requests().len(), 1);
        assert_eq!(
            fx.store.get_session(ChannelName::Telegram, "42").unwrap().unwrap().session_id,
            created.session_id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_registers_and_finalize_releases() {
        let fx = fixture();
        let session = SessionId::new("ses_1");
        let binding = fx.service.create_run_binding(&message(), session.clone());
        binding.initialize();
        assert!(fx.registry.get(&session).is_some());
        assert!(fx.typing.is_running(&session));

        binding.finalize();
        assert!(fx.registry.get(&session).is_none());
        assert!(!fx.typing.is_running(&session));
        assert_eq!(fx.coordinator.cleared(), vec![session]);
        assert_eq!(
            fx.reporter.statuses(),
            vec!["[Telegram] 42 Thinking...".to_string(), "[Telegram] 42 Done".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rebind_moves_the_run_and_finalize_leaves_nothing_behind() {
        let fx = fixture();
        let old = SessionId::new("ses_old");
        let new = SessionId::new("ses_new");
        let mut binding = fx.service.create_run_binding(&message(), old.clone());
        binding.initialize();

        binding.rebind(&new);
        assert_eq!(binding.current_session_id(), &new);
        assert_eq!(binding.run().session_id(), new);
        assert!(fx.registry.get(&old).is_none());
        assert!(!fx.typing.is_running(&old));
        assert!(fx.registry.get(&new).is_some());
        assert!(fx.typing.is_running(&new));
        assert_eq!(fx.coordinator.cleared(), vec![old.clone()]);

        binding.rebind(&new);
        assert_eq!(fx.coordinator.cleared(), vec![old.clone()]);

        binding.finalize();
        for session in [&old, &new] {
            assert!(fx.registry.get(session).is_none());
            assert!(!fx.typing.is_running(session));
        }
        assert_eq!(fx.coordinator.cleared(), vec![old.clone(), new, old]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_binding_releases_it() {
        let fx = fixture();
        let session = SessionId::new("ses_1");
        {
            let binding = fx.service.create_run_binding(&message(), session.clone());
            binding.initialize();
        }
        assert!(fx.registry.get(&session).is_none());
        assert!(!fx.typing.is_running(&session));
    }
}
