//! Periodic typing indicators while a session is working.

use crate::outbound::AdapterMap;
use crate::support::constants::TYPING_INTERVAL;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pilot_channels::ChannelName;
use pilot_opencode::SessionId;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One typing loop per session. Loops send immediately, then on every tick
/// until stopped.
pub struct TypingManager {
    adapters: AdapterMap,
    interval: Duration,
    loops: DashMap<SessionId, JoinHandle<()>>,
}

impl TypingManager {
    pub fn new(adapters: AdapterMap) -> Self {
        Self::with_interval(adapters, TYPING_INTERVAL)
    }

    pub fn with_interval(adapters: AdapterMap, interval: Duration) -> Self {
        Self {
            adapters,
            interval,
            loops: DashMap::new(),
        }
    }

    /// Starts the session's loop. No-op when one is running or the channel
    /// cannot show typing.
    pub fn start(&self, session_id: &SessionId, channel: ChannelName, peer_id: &str) {
        let Some(adapter) = self.adapters.get(&channel).cloned() else {
            return;
        };
        if !adapter.capabilities().typing {
            return;
        }
        let Entry::Vacant(slot) = self.loops.entry(session_id.clone()) else {
            return;
        };

        let peer_id = peer_id.to_string();
        let period = self.interval;
        slot.insert(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(error) = adapter.send_typing(&peer_id).await {
                    tracing::warn!(%channel, error = %error, "typing update failed");
                }
            }
        }));
    }

    pub fn stop(&self, session_id: &str) {
        if let Some((_, handle)) = self.loops.remove(session_id) {
            handle.abort();
        }
    }

    pub fn stop_all(&self) {
        self.loops.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.loops.contains_key(session_id)
    }
}

impl Drop for TypingManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
