//! Long-running bridge process and the one-shot operational commands.

use crate::bridge::{Bridge, configured_adapters};
use crate::config::BridgeConfig;
use crate::outbound::{OutboundDispatcher, OutboundSender};
use crate::store::BridgeStore;
use crate::support::reporting::TracingReporter;
use anyhow::Result;
use pilot_channels::{ChannelName, OutboundKind};
use pilot_opencode::{OpencodeClient, OpencodeClientConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn opencode_client(cfg: &BridgeConfig) -> Result<OpencodeClient> {
    let mut client_config = OpencodeClientConfig::new(cfg.opencode.url.clone());
    client_config.directory = cfg.opencode.directory.clone();
    client_config.username = cfg.opencode.username.clone();
    client_config.password = cfg.opencode.password.clone();
    Ok(OpencodeClient::new(client_config)?)
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = Arc::new(BridgeConfig::load(config_path).await?);
    tracing::info!(
        opencode_url = %cfg.opencode.url,
        opencode_directory = ?cfg.opencode.directory,
        db_path = %cfg.db_path().display(),
        model = ?cfg.bridge.model,
        permission_mode = ?cfg.bridge.permission_mode,
        tool_updates_enabled = cfg.bridge.tool_updates_enabled,
        tool_output_limit = cfg.bridge.tool_output_limit,
        stream_flush_ms = cfg.bridge.stream_flush_ms,
        groups_enabled = cfg.bridge.groups_enabled,
        telegram_enabled = cfg.channels.telegram.enabled,
        telegram_thinking_mode = ?cfg.channels.telegram.thinking_mode,
        "bridge configuration loaded"
    );

    let store = Arc::new(BridgeStore::open(cfg.db_path())?);
    let backend = Arc::new(opencode_client(&cfg)?);
    let adapters = configured_adapters(&cfg)?;
    if adapters.is_empty() {
        tracing::warn!("no channel adapters enabled; the bridge will only process backend events");
    }

    let bridge = Bridge::compose(
        Arc::clone(&cfg),
        backend,
        adapters,
        store,
        Arc::new(TracingReporter),
    );
    let handle = bridge.start().await?;

    shutdown_signal(handle.shutdown_token()).await;
    handle.stop().await;
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = BridgeConfig::load(config_path).await?;
    let client = opencode_client(&cfg)?;
    let store = BridgeStore::open(cfg.db_path())?;
    let adapters = configured_adapters(&cfg)?;
    let pending = store.list_pairing_requests(None, chrono::Utc::now())?;
    tracing::info!(
        opencode_url = %client.base_url(),
        db_path = %cfg.db_path().display(),
        model = ?cfg.default_model().map(|model| model.to_string()),
        adapters = ?adapters.keys().map(ChannelName::as_str).collect::<Vec<_>>(),
        pending_pairing_requests = pending.len(),
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: ChannelName,
    peer_id: &str,
    message: &str,
) -> Result<()> {
    let cfg = BridgeConfig::load(config_path).await?;
    let adapters = configured_adapters(&cfg)?;
    if !adapters.contains_key(&channel) {
        return Err(anyhow::anyhow!("channel {channel} is not enabled in the config"));
    }
    let dispatcher = OutboundDispatcher::new(adapters, Arc::new(TracingReporter));
    dispatcher
        .send_text(channel, peer_id, message, OutboundKind::System)
        .await?;
    tracing::info!(%channel, peer_id, "one-shot message sent");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
        }
    }
    shutdown.cancel();
}
