//! Channel-specific side effects on part and idle events.

use crate::config::TelegramThinkingMode;
use crate::outbound::OutboundSender;
use crate::state::run_state::SharedRun;
use crate::support::text::truncate_text;
use async_trait::async_trait;
use pilot_channels::{ChannelName, OutboundKind};
use pilot_opencode::{MessagePart, PartKind};
use std::collections::HashMap;
use std::sync::Arc;

pub const THINKING_NOTICE: &str = "\u{1F914} Thinking...";
pub const DONE_NOTICE: &str = "\u{2705} Done.";

#[async_trait]
pub trait ChannelHooks: Send + Sync {
    async fn on_part_updated(&self, _run: &SharedRun, _part: &MessagePart) {}

    async fn on_session_idle(&self, _run: &SharedRun) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChannelHooks;

impl ChannelHooks for DefaultChannelHooks {}

/// Hooks keyed by channel; unknown channels get the default (no-op) hooks.
#[derive(Clone)]
pub struct ChannelHooksRegistry {
    by_channel: Arc<HashMap<ChannelName, Arc<dyn ChannelHooks>>>,
    fallback: Arc<dyn ChannelHooks>,
}

impl Default for ChannelHooksRegistry {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl ChannelHooksRegistry {
    pub fn new(by_channel: HashMap<ChannelName, Arc<dyn ChannelHooks>>) -> Self {
        Self {
            by_channel: Arc::new(by_channel),
            fallback: Arc::new(DefaultChannelHooks),
        }
    }

    pub fn get(&self, channel: ChannelName) -> Arc<dyn ChannelHooks> {
        self.by_channel
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Thinking notices for Telegram: a one-time "Thinking..." when reasoning
/// starts, reasoning dumps in `raw_debug`, and "Done." once the turn settles.
pub struct TelegramChannelHooks {
    thinking_mode: TelegramThinkingMode,
    output_limit: usize,
    outbound: Arc<dyn OutboundSender>,
}

impl TelegramChannelHooks {
    pub fn new(
        thinking_mode: TelegramThinkingMode,
        output_limit: usize,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            thinking_mode,
            output_limit,
            outbound,
        }
    }

    async fn send_system(&self, channel: ChannelName, peer_id: &str, text: &str) {
        if let Err(error) = self
            .outbound
            .send_text(channel, peer_id, text, OutboundKind::System)
            .await
        {
            tracing::warn!(%channel, peer_id, error = %error, "telegram thinking notice failed");
        }
    }
}

#[async_trait]
impl ChannelHooks for TelegramChannelHooks {
    async fn on_part_updated(&self, run: &SharedRun, part: &MessagePart) {
        let PartKind::Reasoning { text, time } = &part.kind else {
            return;
        };
        if self.thinking_mode == TelegramThinkingMode::Off {
            return;
        }

        let mut notices = Vec::new();
        let (channel, peer_id) = {
            let mut run = run.lock();
            let (channel, peer_id) = (run.channel, run.peer_id.clone());
            let Some(telegram) = run.telegram_mut() else {
                return;
            };
            if telegram.streaming_suppressed {
                return;
            }
            if !telegram.thinking_notice_sent {
                telegram.thinking_notice_sent = true;
                notices.push(THINKING_NOTICE.to_string());
            }

            let finished = time.is_some_and(|time| time.end.is_some());
            let text = text.trim();
            if self.thinking_mode == TelegramThinkingMode::RawDebug && finished && !text.is_empty() {
                let part_id = part.id.as_ref().map(ToString::to_string).unwrap_or_default();
                if telegram.seen_reasoning_parts.insert(part_id) {
                    notices.push(format!(
                        "[debug][thinking]\n{}",
                        truncate_text(text, self.output_limit)
                    ));
                }
            }
            (channel, peer_id)
        };

        for notice in notices {
            self.send_system(channel, &peer_id, &notice).await;
        }
    }

    async fn on_session_idle(&self, run: &SharedRun) {
        let (channel, peer_id) = {
            let mut run = run.lock();
            let (channel, peer_id) = (run.channel, run.peer_id.clone());
            let Some(telegram) = run.telegram_mut() else {
                return;
            };
            if telegram.streaming_suppressed {
                telegram.thinking_notice_sent = false;
                return;
            }
            if !telegram.thinking_notice_sent || self.thinking_mode == TelegramThinkingMode::Off {
                return;
            }
            telegram.thinking_notice_sent = false;
            (channel, peer_id)
        };
        self.send_system(channel, &peer_id, DONE_NOTICE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run_state::RunState;
    use crate::testing::RecordingOutbound;
    use pilot_opencode::{PartId, PartTime, SessionId};

    fn run() -> SharedRun {
        SharedRun::new(RunState::new(
            SessionId::new("ses_1"),
            ChannelName::Telegram,
            "42",
            false,
        ))
    }

    fn reasoning(id: &str, text: &str, ended: bool) -> MessagePart {
        MessagePart {
            id: Some(PartId::new(id)),
            session_id: SessionId::new("ses_1"),
            message_id: None,
            kind: PartKind::Reasoning {
                text: text.to_string(),
                time: Some(PartTime {
                    start: Some(1),
                    end: ended.then_some(2),
                }),
            },
        }
    }

    fn hooks(mode: TelegramThinkingMode, outbound: &Arc<RecordingOutbound>) -> TelegramChannelHooks {
        TelegramChannelHooks::new(mode, 20, outbound.clone())
    }

    #[tokio::test]
    async fn summary_mode_announces_thinking_once_and_done_on_idle() {
        let outbound = Arc::new(RecordingOutbound::default());
        let hooks = hooks(TelegramThinkingMode::Summary, &outbound);
        let run = run();

        hooks.on_part_updated(&run, &reasoning("r1", "pondering", false)).await;
        hooks.on_part_updated(&run, &reasoning("r1", "pondering more", true)).await;
        hooks.on_session_idle(&run).await;
        hooks.on_session_idle(&run).await;

        assert_eq!(outbound.texts(), vec![THINKING_NOTICE.to_string(), DONE_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn raw_debug_dumps_each_finished_reasoning_part_once() {
        let outbound = Arc::new(RecordingOutbound::default());
        let hooks = hooks(TelegramThinkingMode::RawDebug, &outbound);
        let run = run();

        hooks.on_part_updated(&run, &reasoning("r1", "in progress", false)).await;
        hooks
            .on_part_updated(&run, &reasoning("r1", "a rather long chain of thought", true))
            .await;
        hooks
            .on_part_updated(&run, &reasoning("r1", "a rather long chain of thought", true))
            .await;

        assert_eq!(
            outbound.texts(),
            vec![
                THINKING_NOTICE.to_string(),
                "[debug][thinking]\na rather long cha...".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn off_mode_and_suppressed_runs_stay_silent() {
        let outbound = Arc::new(RecordingOutbound::default());
        let off = hooks(TelegramThinkingMode::Off, &outbound);
        let run = run();
        off.on_part_updated(&run, &reasoning("r1", "hmm", true)).await;
        off.on_session_idle(&run).await;

        let summary = hooks(TelegramThinkingMode::Summary, &outbound);
        if let Some(telegram) = run.lock().telegram_mut() {
            telegram.streaming_suppressed = true;
            telegram.thinking_notice_sent = true;
        }
        summary.on_part_updated(&run, &reasoning("r2", "hmm", true)).await;
        summary.on_session_idle(&run).await;

        assert!(outbound.texts().is_empty());
        assert!(!run.lock().telegram().unwrap().thinking_notice_sent);
    }

    #[tokio::test]
    async fn unknown_channels_get_silent_hooks() {
        let registry = ChannelHooksRegistry::default();
        let run = run();
        registry
            .get(ChannelName::Slack)
            .on_part_updated(&run, &reasoning("r1", "hmm", true))
            .await;
        assert!(!run.lock().telegram().unwrap().thinking_notice_sent);
    }
}
