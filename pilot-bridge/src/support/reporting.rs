//! Human-facing status lines for turns ("Thinking...", "Done").

use crate::inbound::access_identity::normalize_whatsapp_id;
use crate::state::run_state::{RunState, SessionModels};
use pilot_channels::{ChannelName, OutboundKind};
use pilot_opencode::ModelRef;

/// Observer for bridge activity. Every method defaults to a no-op.
pub trait BridgeReporter: Send + Sync {
    fn on_status(&self, _message: &str) {}

    fn on_inbound(&self, _channel: ChannelName, _peer_id: &str, _text: &str, _from_me: bool) {}

    fn on_outbound(&self, _channel: ChannelName, _peer_id: &str, _text: &str, _kind: OutboundKind) {
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl BridgeReporter for TracingReporter {
    fn on_status(&self, message: &str) {
        tracing::info!(status = %message, "bridge status");
    }

    fn on_inbound(&self, channel: ChannelName, peer_id: &str, text: &str, from_me: bool) {
        tracing::info!(
            %channel,
            peer_id,
            from_me,
            length = text.chars().count(),
            "inbound message"
        );
    }

    fn on_outbound(&self, channel: ChannelName, peer_id: &str, text: &str, kind: OutboundKind) {
        tracing::info!(
            %channel,
            peer_id,
            kind = kind.as_str(),
            length = text.chars().count(),
            "outbound message"
        );
    }
}

pub fn format_peer(channel: ChannelName, peer_id: &str) -> String {
    match channel {
        ChannelName::Whatsapp => normalize_whatsapp_id(peer_id),
        _ => peer_id.to_string(),
    }
}

fn model_label(model: Option<&ModelRef>) -> Option<String> {
    model.map(ToString::to_string)
}

/// Announces the run as thinking. Repeats are suppressed while the label is
/// unchanged and the run is still marked active.
pub fn report_thinking(run: &mut RunState, session_models: &SessionModels, reporter: &dyn BridgeReporter) {
    let model = session_models
        .get(&run.session_id)
        .map(|entry| entry.value().clone());
    let next_label = match model_label(model.as_ref()) {
        Some(label) => format!("Thinking ({label})"),
        None => "Thinking...".to_string(),
    };
    if run.lifecycle.thinking_active && run.lifecycle.thinking_label.as_deref() == Some(next_label.as_str()) {
        return;
    }
    reporter.on_status(&format!(
        "[{}] {} {}",
        run.channel.label(),
        format_peer(run.channel, &run.peer_id),
        next_label
    ));
    run.lifecycle.thinking_label = Some(next_label);
    run.lifecycle.thinking_active = true;
}

/// Announces completion, once per thinking phase.
pub fn report_done(run: &mut RunState, session_models: &SessionModels, reporter: &dyn BridgeReporter) {
    if !run.lifecycle.thinking_active {
        return;
    }
    let model = session_models
        .get(&run.session_id)
        .map(|entry| entry.value().clone());
    let suffix = model_label(model.as_ref())
        .map(|label| format!(" ({label})"))
        .unwrap_or_default();
    reporter.on_status(&format!(
        "[{}] {} Done{}",
        run.channel.label(),
        format_peer(run.channel, &run.peer_id),
        suffix
    ));
    run.lifecycle.thinking_active = false;
}
