//! Drops Telegram updates that long polling delivers more than once.

use pilot_channels::{ChannelName, InboundMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_TTL: Duration = Duration::from_secs(120);
const DEFAULT_MAX_ENTRIES: usize = 2048;

#[derive(Debug, Default)]
struct SeenKeys {
    at: HashMap<String, Instant>,
    // insertion order for oldest-first eviction
    order: VecDeque<String>,
}

#[derive(Debug)]
pub struct TelegramInboundDeduper {
    seen: Mutex<SeenKeys>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for TelegramInboundDeduper {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl TelegramInboundDeduper {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: Mutex::new(SeenKeys::default()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn is_duplicate(&self, message: &InboundMessage) -> bool {
        if message.channel != ChannelName::Telegram {
            return false;
        }
        let Some(message_id) = message.raw.get("message_id").and_then(|v| v.as_i64()) else {
            return false;
        };
        let chat_id = match message.raw.get("chat").and_then(|chat| chat.get("id")) {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            _ => message.peer_id.clone(),
        };
        let key = format!("{chat_id}:{message_id}");
        let now = Instant::now();

        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(seen_at) = seen.at.get(&key) {
            if now.duration_since(*seen_at) <= self.ttl {
                return true;
            }
        }
        if seen.at.insert(key.clone(), now).is_none() {
            seen.order.push_back(key);
        }
        self.prune(&mut seen, now);
        false
    }

    fn prune(&self, seen: &mut SeenKeys, now: Instant) {
        if seen.at.len() <= self.max_entries {
            return;
        }
        let ttl = self.ttl;
        seen.at.retain(|_, at| now.duration_since(*at) <= ttl);
        let SeenKeys { at, order } = seen;
        order.retain(|key| at.contains_key(key));

        while seen.at.len() > self.max_entries {
            let Some(oldest) = seen.order.pop_front() else {
                break;
            };
            seen.at.remove(&oldest);
        }
    }

    pub fn clear(&self) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.at.clear();
        seen.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(chat: i64, message_id: i64) -> InboundMessage {
        InboundMessage::new(ChannelName::Telegram, chat.to_string(), "hi")
            .with_raw(json!({"message_id": message_id, "chat": {"id": chat}}))
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_update_is_dropped_within_ttl() {
        let deduper = TelegramInboundDeduper::default();
        assert!(!deduper.is_duplicate(&update(1, 10)));
        assert!(deduper.is_duplicate(&update(1, 10)));
        assert!(!deduper.is_duplicate(&update(2, 10)));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!deduper.is_duplicate(&update(1, 10)));
    }

    #[tokio::test]
    async fn other_channels_and_missing_ids_pass_through() {
        let deduper = TelegramInboundDeduper::default();
        let slack = InboundMessage::new(ChannelName::Slack, "C1", "hi")
            .with_raw(json!({"message_id": 1}));
        assert!(!deduper.is_duplicate(&slack));
        assert!(!deduper.is_duplicate(&slack));

        let no_id = InboundMessage::new(ChannelName::Telegram, "1", "hi");
        assert!(!deduper.is_duplicate(&no_id));
        assert!(!deduper.is_duplicate(&no_id));
    }

    #[tokio::test]
    async fn oldest_entry_is_evicted_past_capacity() {
        let deduper = TelegramInboundDeduper::new(Duration::from_secs(120), 2);
        assert!(!deduper.is_duplicate(&update(1, 1)));
        assert!(!deduper.is_duplicate(&update(1, 2)));
        assert!(!deduper.is_duplicate(&update(1, 3)));
        // (1,1) was evicted, so it is accepted again
        assert!(!deduper.is_duplicate(&update(1, 1)));
        assert!(deduper.is_duplicate(&update(1, 3)));
    }
}
