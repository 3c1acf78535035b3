//! Slash commands handled by the bridge instead of the backend.

use crate::state::model_store::ModelStore;
use crate::store::BridgeStore;
use crate::support::constants::model_preset;
use pilot_channels::ChannelName;
use pilot_opencode::ModelRef;

const HELP_TEXT: &str =
    "/opus - Claude Opus 4.5\n/codex - GPT 5.2 Codex\n/model - show current\n/reset - start fresh\n/help - this";

pub struct CommandContext<'a> {
    pub store: &'a BridgeStore,
    pub models: &'a ModelStore,
    pub default_model: Option<&'a ModelRef>,
    pub channel: ChannelName,
    pub peer_key: &'a str,
}

/// Returns the reply for a recognized command, or `None` when the text should
/// go to the backend as a normal message.
pub fn handle_command(ctx: &CommandContext<'_>, input: &str) -> anyhow::Result<Option<String>> {
    let trimmed = input.trim();
    let Some(body) = trimmed.strip_prefix('/') else {
        return Ok(None);
    };
    let command = body
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if let Some(model) = model_preset(&command) {
        let reply = format!("Model switched to {model}");
        tracing::info!(
            channel = %ctx.channel,
            peer_id = ctx.peer_key,
            model = %model,
            "model switched via command"
        );
        ctx.models.set(ctx.channel, ctx.peer_key, model);
        return Ok(Some(reply));
    }

    match command.as_str() {
        "model" => {
            let current = ctx
                .models
                .get(ctx.channel, ctx.peer_key, ctx.default_model)
                .map(|model| model.to_string())
                .unwrap_or_else(|| "default".to_string());
            Ok(Some(format!("Current model: {current}")))
        }
        "reset" => {
            ctx.models.clear(ctx.channel, ctx.peer_key);
            ctx.store.delete_session(ctx.channel, ctx.peer_key)?;
            tracing::info!(channel = %ctx.channel, peer_id = ctx.peer_key, "session and model reset");
            Ok(Some(
                "Session and model reset. Send a message to start fresh.".to_string(),
            ))
        }
        "help" => Ok(Some(HELP_TEXT.to_string())),
        _ => Ok(None),
    }
}
