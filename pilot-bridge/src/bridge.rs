//! Composition root: builds the services once per bridge instance and runs
//! the inbound loop and the backend event processor.

use crate::config::BridgeConfig;
use crate::inbound::access_control::AccessControlService;
use crate::inbound::deduper::TelegramInboundDeduper;
use crate::inbound::pipeline::InboundPipeline;
use crate::inbound::prompt_execution::PromptExecutionService;
use crate::inbound::run_execution::RunExecutionService;
use crate::inbound::session_binding::SessionBindingService;
use crate::inbound::session_factory::SessionFactory;
use crate::outbound::{AdapterMap, OutboundDispatcher, OutboundSender};
use crate::state::model_store::ModelStore;
use crate::state::run_registry::SessionRunRegistry;
use crate::state::run_state::{ActiveRuns, SessionModels};
use crate::store::BridgeStore;
use crate::stream::coordinator::{StreamCoordinator, StreamCoordinators};
use crate::stream::events::BridgeEventProcessor;
use crate::stream::hooks::{ChannelHooks, ChannelHooksRegistry, TelegramChannelHooks};
use crate::stream::router::{BridgeEventRouter, EventRouterDeps};
use crate::stream::telegram::TelegramStreamCoordinator;
use crate::stream::typing::TypingManager;
use crate::support::reporting::BridgeReporter;
use chrono::Utc;
use pilot_channels::{ChannelAdapter, ChannelName, InboundMessage, TelegramAdapter};
use pilot_opencode::OpencodeBackend;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 256;
const PAIRING_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

pub fn configured_adapters(config: &BridgeConfig) -> anyhow::Result<AdapterMap> {
    let mut adapters: HashMap<ChannelName, Arc<dyn ChannelAdapter>> = HashMap::new();
    let telegram = &config.channels.telegram;
    if telegram.enabled {
        let adapter = TelegramAdapter::new(&telegram.bot_token, config.bridge.groups_enabled)?;
        adapters.insert(ChannelName::Telegram, Arc::new(adapter));
    }
    Ok(Arc::new(adapters))
}

pub struct Bridge {
    adapters: AdapterMap,
    store: Arc<BridgeStore>,
    typing: Arc<TypingManager>,
    pipeline: Arc<InboundPipeline>,
    processor: BridgeEventProcessor,
}

impl Bridge {
    pub fn compose(
        config: Arc<BridgeConfig>,
        backend: Arc<dyn OpencodeBackend>,
        adapters: AdapterMap,
        store: Arc<BridgeStore>,
        reporter: Arc<dyn BridgeReporter>,
    ) -> Self {
        let settings = &config.bridge;
        let active_runs = ActiveRuns::default();
        let session_models = SessionModels::default();
        let default_model = config.default_model();

        let outbound: Arc<dyn OutboundSender> = Arc::new(OutboundDispatcher::new(
            Arc::clone(&adapters),
            Arc::clone(&reporter),
        ));
        let typing = Arc::new(TypingManager::new(Arc::clone(&adapters)));

        let mut coordinators: HashMap<ChannelName, Arc<dyn StreamCoordinator>> = HashMap::new();
        let mut hooks: HashMap<ChannelName, Arc<dyn ChannelHooks>> = HashMap::new();
        if let Some(adapter) = adapters.get(&ChannelName::Telegram) {
            coordinators.insert(
                ChannelName::Telegram,
                Arc::new(TelegramStreamCoordinator::new(
                    Arc::clone(&active_runs),
                    Some(Arc::clone(adapter)),
                    Duration::from_millis(settings.stream_flush_ms),
                    settings.max_role_entries_per_session,
                )),
            );
            hooks.insert(
                ChannelName::Telegram,
                Arc::new(TelegramChannelHooks::new(
                    config.channels.telegram.thinking_mode,
                    settings.tool_output_limit,
                    Arc::clone(&outbound),
                )),
            );
        }
        let coordinators = StreamCoordinators::new(coordinators);
        let hooks = ChannelHooksRegistry::new(hooks);

        let registry = Arc::new(SessionRunRegistry::new(Arc::clone(&active_runs)));
        let models = Arc::new(ModelStore::new());
        let factory = Arc::new(SessionFactory::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&outbound),
            Arc::clone(&reporter),
            settings.permission_mode,
        ));
        let bindings = Arc::new(SessionBindingService::new(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::clone(&registry),
            Arc::clone(&typing),
            coordinators.clone(),
            Arc::clone(&session_models),
            Arc::clone(&reporter),
            settings.tool_updates_enabled,
        ));
        let prompts = PromptExecutionService::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&factory),
        );
        let runs = Arc::new(RunExecutionService::new(
            Arc::clone(&models),
            default_model.clone(),
            prompts,
            Arc::clone(&bindings),
            coordinators.clone(),
            Arc::clone(&outbound),
        ));

        let pipeline = Arc::new(InboundPipeline {
            adapters: Arc::clone(&adapters),
            store: Arc::clone(&store),
            models,
            default_model,
            registry,
            access: AccessControlService::new(
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::clone(&outbound),
            ),
            bindings,
            runs,
            deduper: TelegramInboundDeduper::default(),
            outbound: Arc::clone(&outbound),
            reporter: Arc::clone(&reporter),
        });

        let router = Arc::new(BridgeEventRouter::new(EventRouterDeps {
            backend: Arc::clone(&backend),
            permission_mode: settings.permission_mode,
            tool_output_limit: settings.tool_output_limit,
            active_runs,
            session_models,
            typing: Arc::clone(&typing),
            coordinators,
            hooks,
            outbound,
            reporter,
        }));
        let processor = BridgeEventProcessor::new(backend, router);

        Self {
            adapters,
            store,
            typing,
            pipeline,
            processor,
        }
    }

    /// Starts the adapters and background loops. An adapter that fails to
    /// start is logged and skipped.
    pub async fn start(self) -> anyhow::Result<BridgeHandle> {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        for (channel, adapter) in self.adapters.iter() {
            match adapter.start(tx.clone()).await {
                Ok(()) => tracing::info!(%channel, "channel adapter started"),
                Err(error) => {
                    tracing::error!(%channel, error = %error, "channel adapter failed to start")
                }
            }
        }
        drop(tx);

        let inbound = tokio::spawn(run_inbound_loop(
            Arc::clone(&self.pipeline),
            rx,
            shutdown.clone(),
        ));
        let processor = self.processor;
        let events = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { processor.run(shutdown).await }
        });
        let pruning = tokio::spawn(run_pairing_pruner(
            Arc::clone(&self.store),
            shutdown.clone(),
        ));

        tracing::info!(adapter_count = self.adapters.len(), "bridge started");
        Ok(BridgeHandle {
            adapters: self.adapters,
            typing: self.typing,
            pipeline: self.pipeline,
            shutdown,
            tasks: vec![inbound, events, pruning],
        })
    }
}

pub struct BridgeHandle {
    adapters: AdapterMap,
    typing: Arc<TypingManager>,
    pipeline: Arc<InboundPipeline>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Handles `message` and waits until the peer's queued turns finish.
    pub async fn dispatch_inbound(&self, message: InboundMessage) -> anyhow::Result<()> {
        self.pipeline.dispatch_inbound(message).await
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels the event stream and background loops, stops typing and the
    /// adapters. Turns already queued are not awaited.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.typing.stop_all();
        for (channel, adapter) in self.adapters.iter() {
            if let Err(error) = adapter.stop().await {
                tracing::warn!(%channel, error = %error, "channel adapter failed to stop");
            }
        }
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "bridge task join failed during shutdown");
            }
        }
        tracing::info!("bridge stopped");
    }
}

async fn run_inbound_loop(
    pipeline: Arc<InboundPipeline>,
    mut rx: mpsc::Receiver<InboundMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = shutdown.cancelled() => break,
            inbound = rx.recv() => inbound,
        };
        let Some(inbound) = inbound else {
            tracing::info!("inbound channel closed");
            break;
        };
        if let Err(error) = pipeline.handle_inbound(inbound).await {
            tracing::warn!(error = %format!("{error:#}"), "handle_inbound failed");
        }
    }
    tracing::info!("inbound loop stopped");
}

async fn run_pairing_pruner(store: Arc<BridgeStore>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PAIRING_PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store.prune_pairing_requests(Utc::now()) {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "pruned expired pairing requests"),
            Err(error) => tracing::warn!(error = %error, "pairing prune failed"),
        }
    }
}
