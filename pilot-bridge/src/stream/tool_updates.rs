//! `[tool]` progress lines for runs that opted into tool updates.

use crate::outbound::OutboundSender;
use crate::state::run_state::SharedRun;
use crate::support::constants::tool_label;
use crate::support::text::{format_input_summary, truncate_text};
use pilot_channels::OutboundKind;
use pilot_opencode::{MessagePart, PartKind};
use std::sync::Arc;

const TITLE_SUMMARY_LIMIT: usize = 120;

pub struct ToolUpdateNotifier {
    output_limit: usize,
    outbound: Arc<dyn OutboundSender>,
}

impl ToolUpdateNotifier {
    pub fn new(output_limit: usize, outbound: Arc<dyn OutboundSender>) -> Self {
        Self {
            output_limit,
            outbound,
        }
    }

    /// Sends one line per (call, status) transition.
    pub async fn notify(&self, run: &SharedRun, part: &MessagePart) {
        let PartKind::Tool {
            call_id,
            tool,
            state,
        } = &part.kind
        else {
            return;
        };

        let (channel, peer_id) = {
            let mut run = run.lock();
            if !run.tool_updates_enabled {
                return;
            }
            if run.seen_tool_states.get(call_id) == Some(&state.status) {
                return;
            }
            run.seen_tool_states.insert(call_id.clone(), state.status.clone());
            (run.channel, run.peer_id.clone())
        };

        let title = state
            .title
            .clone()
            .filter(|title| !title.is_empty())
            .or_else(|| {
                Some(truncate_text(&format_input_summary(&state.input), TITLE_SUMMARY_LIMIT))
                    .filter(|summary| !summary.is_empty())
            })
            .unwrap_or_else(|| "running".to_string());
        let mut message = format!("[tool] {} {}: {title}", tool_label(tool), state.status);

        if state.status == "completed" {
            let output = state.output.as_deref().unwrap_or_default().trim();
            let output = truncate_text(output, self.output_limit);
            if !output.is_empty() {
                message.push('\n');
                message.push_str(&output);
            }
        }

        if let Err(error) = self
            .outbound
            .send_text(channel, &peer_id, &message, OutboundKind::Tool)
            .await
        {
            tracing::warn!(%channel, peer_id, error = %error, "tool update send failed");
        }
    }
}
