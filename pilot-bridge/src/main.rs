//! pilot-bridge main binary.
//!
//! Bridges chat channels to an OpenCode server: inbound messages become
//! prompts on per-peer sessions, replies and streamed text flow back out.

mod admin;
mod bridge;
mod config;
mod inbound;
mod outbound;
mod server;
mod state;
mod store;
mod stream;
mod support;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use pilot_channels::ChannelName;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "pilot-bridge", version, about = "Chat channel bridge for OpenCode")]
struct Cli {
    /// Config file (defaults to ~/.pilot-bridge/config.toml).
    #[arg(long, global = true, env = "PILOT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the bridge (default).
    Serve,
    /// Validate config and the local store.
    Doctor,
    /// Review pending pairing requests.
    Pairing {
        #[command(subcommand)]
        action: PairingAction,
    },
    /// Add a peer to a channel's allowlist.
    Allow { channel: ChannelName, peer: String },
    /// One-shot send to a peer via a configured channel.
    Send {
        channel: ChannelName,
        peer: String,
        message: String,
    },
}

#[derive(Debug, Subcommand)]
enum PairingAction {
    List {
        channel: Option<ChannelName>,
    },
    Approve {
        code: String,
        #[arg(long)]
        channel: Option<ChannelName>,
    },
    Deny {
        code: String,
        #[arg(long)]
        channel: Option<ChannelName>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(anyhow::anyhow!("failed to load .env: {e}"));
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config;

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Serve
    };

    match command {
        Command::Serve => server::serve(config_path).await,
        Command::Doctor => server::doctor(config_path).await,
        Command::Pairing { action } => run_pairing(config_path, action).await,
        Command::Allow { channel, peer } => {
            let store = open_store(config_path).await?;
            admin::allow_peer(&store, channel, &peer)?;
            println!("allowed {channel} {}", peer.trim());
            Ok(())
        }
        Command::Send {
            channel,
            peer,
            message,
        } => server::send_one_shot(config_path, channel, &peer, &message).await,
    }
}

async fn open_store(config_path: Option<PathBuf>) -> anyhow::Result<store::BridgeStore> {
    let cfg = config::BridgeConfig::load(config_path).await?;
    store::BridgeStore::open(cfg.db_path())
}

async fn run_pairing(config_path: Option<PathBuf>, action: PairingAction) -> anyhow::Result<()> {
    let store = open_store(config_path).await?;
    let now = chrono::Utc::now();
    match action {
        PairingAction::List { channel } => {
            let requests = admin::list_pairing(&store, channel, now)?;
            if requests.is_empty() {
                println!("no pending pairing requests");
            }
            for request in requests {
                println!(
                    "{}\t{}\t{}\texpires {}",
                    request.channel,
                    request.code,
                    request.peer_id,
                    request.expires_at.to_rfc3339()
                );
            }
        }
        PairingAction::Approve { code, channel } => {
            let approved = admin::approve_pairing(&store, &code, channel, now)?;
            println!("approved {} {}", approved.channel, approved.peer_id);
        }
        PairingAction::Deny { code, channel } => {
            let channel = admin::deny_pairing(&store, &code, channel, now)?;
            println!("denied {channel} {code}");
        }
    }
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,pilot_bridge=debug,pilot_channels=debug,pilot_opencode=debug",
        ),
    };
    let log_format = std::env::var("PILOT_BRIDGE_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported PILOT_BRIDGE_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

pub(crate) fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
