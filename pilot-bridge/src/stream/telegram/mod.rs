//! Telegram stream coordinator: reconciles out-of-order role and part events
//! into debounced edits of a single outbound message per session.

mod flush_engine;
mod part_handlers;
mod role_index;
mod state_store;

use crate::state::run_state::ActiveRuns;
use crate::stream::coordinator::StreamCoordinator;
use async_trait::async_trait;
use flush_engine::FlushEngine;
use pilot_channels::ChannelAdapter;
use pilot_opencode::{MessageInfo, MessagePartDelta, MessagePartUpdated, SessionId};
use role_index::RoleIndex;
use state_store::StreamStateStore;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Role and text state behind one lock; never held across an await.
pub(crate) struct StreamTables {
    roles: RoleIndex,
    states: StreamStateStore,
}

/// What the stream needs from an active Telegram run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TelegramRunView {
    peer_id: String,
    streaming_suppressed: bool,
}

/// The session's run, if it is a Telegram run. Suppressed runs are skipped
/// unless `include_suppressed` is set.
pub(crate) fn resolve_telegram_run(
    active_runs: &ActiveRuns,
    session_id: &str,
    include_suppressed: bool,
) -> Option<TelegramRunView> {
    let run = active_runs.get(session_id)?.value().clone();
    let run = run.lock();
    let telegram = run.telegram()?;
    if telegram.streaming_suppressed && !include_suppressed {
        return None;
    }
    Some(TelegramRunView {
        peer_id: run.peer_id.clone(),
        streaming_suppressed: telegram.streaming_suppressed,
    })
}

pub struct TelegramStreamCoordinator {
    tables: Arc<Mutex<StreamTables>>,
    active_runs: ActiveRuns,
    flush: FlushEngine,
}

impl TelegramStreamCoordinator {
    pub fn new(
        active_runs: ActiveRuns,
        adapter: Option<Arc<dyn ChannelAdapter>>,
        flush_delay: Duration,
        max_role_entries: usize,
    ) -> Self {
        let tables = Arc::new(Mutex::new(StreamTables {
            roles: RoleIndex::new(max_role_entries),
            states: StreamStateStore::default(),
        }));
        let flush = FlushEngine::new(Arc::clone(&tables), active_runs.clone(), adapter, flush_delay);
        Self {
            tables,
            active_runs,
            flush,
        }
    }

    fn lock_tables(&self) -> MutexGuard<'_, StreamTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StreamCoordinator for TelegramStreamCoordinator {
    fn on_message_updated(&self, info: &MessageInfo) {
        if resolve_telegram_run(&self.active_runs, &info.session_id, false).is_none() {
            return;
        }
        let should_flush = {
            let mut tables = self.lock_tables();
            let StreamTables { roles, states } = &mut *tables;
            roles.remember(&info.session_id, &info.id, info.role);
            states
                .get_mut(&info.session_id)
                .is_some_and(|state| state.on_role_resolved(&info.session_id, &info.id, info.role, roles))
        };
        if should_flush {
            self.flush.mark_pending(&info.session_id);
        }
    }

    async fn on_part_delta(&self, event: &MessagePartDelta) {
        let Some(run) = resolve_telegram_run(&self.active_runs, &event.session_id, true) else {
            return;
        };
        let should_flush = {
            let mut tables = self.lock_tables();
            let StreamTables { roles, states } = &mut *tables;
            part_handlers::handle_part_delta(states, roles, &run, event)
        };
        if should_flush {
            self.flush.mark_pending(&event.session_id);
        }
    }

    async fn on_part_updated(&self, event: &MessagePartUpdated) {
        let session_id = &event.part.session_id;
        let Some(run) = resolve_telegram_run(&self.active_runs, session_id, true) else {
            return;
        };
        let should_flush = {
            let mut tables = self.lock_tables();
            let StreamTables { roles, states } = &mut *tables;
            part_handlers::handle_part_updated(states, roles, &run, event)
        };
        if should_flush {
            self.flush.mark_pending(session_id);
        }
    }

    async fn on_session_idle(&self, session_id: &SessionId) {
        self.flush.on_session_idle(session_id).await;
    }

    async fn finalize_reply(&self, session_id: &SessionId, peer_id: &str, text: &str) -> bool {
        self.flush.finalize_reply(session_id, peer_id, text).await
    }

    fn has_streamed_message(&self, session_id: &SessionId) -> bool {
        self.flush.has_streamed_message(session_id)
    }

    fn clear_session(&self, session_id: &SessionId) {
        {
            let mut tables = self.lock_tables();
            tables.roles.clear_session(session_id);
            tables.states.clear_session(session_id);
        }
        self.flush.forget_session(session_id);
    }
}
