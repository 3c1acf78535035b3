//! Debounced, per-session serialized delivery of the rendered stream text.

use super::{StreamTables, TelegramRunView, resolve_telegram_run};
use crate::state::run_state::ActiveRuns;
use dashmap::DashMap;
use pilot_channels::ChannelAdapter;
use pilot_opencode::SessionId;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// FIFO async lock per session. Entries are dropped once no one holds or
/// waits on them.
#[derive(Default)]
struct SessionLocks {
    locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionLocks {
    async fn run<T>(&self, session_id: &SessionId, operation: impl Future<Output = T>) -> T {
        let lock = Arc::clone(&*self.locks.entry(session_id.clone()).or_default());
        let output = {
            let _guard = lock.lock().await;
            operation.await
        };
        self.locks.remove_if(session_id, |_, current| {
            Arc::ptr_eq(current, &lock) && Arc::strong_count(current) == 2
        });
        output
    }

    fn forget(&self, session_id: &str) {
        self.locks.remove(session_id);
    }
}

struct FlushInner {
    tables: Arc<Mutex<StreamTables>>,
    active_runs: ActiveRuns,
    adapter: Option<Arc<dyn ChannelAdapter>>,
    flush_delay: Duration,
    locks: SessionLocks,
}

pub struct FlushEngine {
    inner: Arc<FlushInner>,
}

impl FlushEngine {
    pub fn new(
        tables: Arc<Mutex<StreamTables>>,
        active_runs: ActiveRuns,
        adapter: Option<Arc<dyn ChannelAdapter>>,
        flush_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FlushInner {
                tables,
                active_runs,
                adapter,
                flush_delay,
                locks: SessionLocks::default(),
            }),
        }
    }

    pub fn mark_pending(&self, session_id: &SessionId) {
        let mut tables = self.inner.lock_tables();
        let Some(state) = tables.states.get_mut(session_id) else {
            return;
        };
        state.pending = true;
        if state.disabled || state.timer.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let session_id = session_id.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.flush_delay).await;
            inner.release_timer(&session_id);
            inner.flush(&session_id, false).await;
        }));
    }

    pub async fn on_session_idle(&self, session_id: &SessionId) {
        self.inner.flush(session_id, true).await;
    }

    pub fn has_streamed_message(&self, session_id: &str) -> bool {
        self.inner
            .lock_tables()
            .states
            .get(session_id)
            .is_some_and(|state| state.message_id.is_some())
    }

    pub fn forget_session(&self, session_id: &str) {
        self.inner.locks.forget(session_id);
    }

    /// Flushes what has streamed so far, then edits the streamed message to the
    /// final text. Returns `false` when no streamed message exists, the text is
    /// empty or too long, or the edit fails.
    pub async fn finalize_reply(&self, session_id: &SessionId, peer_id: &str, text: &str) -> bool {
        let inner = &self.inner;
        inner
            .locks
            .run(session_id, async {
                if resolve_telegram_run(&inner.active_runs, session_id, false).is_none() {
                    return false;
                }
                let text = text.trim();
                if text.is_empty() {
                    return false;
                }

                inner.flush_now(session_id, true).await;

                let Some(adapter) = inner.progress_adapter() else {
                    return false;
                };
                let message_id = inner
                    .lock_tables()
                    .states
                    .get(session_id)
                    .and_then(|state| state.message_id);
                let Some(message_id) = message_id else {
                    return false;
                };
                if text.chars().count() > adapter.max_text_length() {
                    return false;
                }

                match adapter.send_text_progress(peer_id, text, Some(message_id)).await {
                    Ok(receipt) => {
                        if let Some(state) = inner.lock_tables().states.get_mut(session_id) {
                            state.message_id = Some(receipt.message_id);
                            state.text = text.to_string();
                            state.pending = false;
                        }
                        true
                    }
                    Err(error) => {
                        tracing::warn!(
                            session_id = %session_id,
                            message_id,
                            error = %error,
                            "telegram final reply edit failed"
                        );
                        false
                    }
                }
            })
            .await
    }
}

struct FlushRequest {
    adapter: Arc<dyn ChannelAdapter>,
    peer_id: String,
    text: String,
    message_id: Option<i64>,
}

impl FlushInner {
    fn lock_tables(&self) -> MutexGuard<'_, StreamTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn progress_adapter(&self) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapter
            .as_ref()
            .filter(|adapter| adapter.capabilities().progress)
            .cloned()
    }

    // Called from the timer task itself, so the handle is dropped, not aborted.
    fn release_timer(&self, session_id: &str) {
        if let Some(state) = self.lock_tables().states.get_mut(session_id) {
            state.timer = None;
        }
    }

    async fn flush(&self, session_id: &SessionId, force: bool) {
        self.locks
            .run(session_id, self.flush_now(session_id, force))
            .await;
    }

    async fn flush_now(&self, session_id: &SessionId, force: bool) {
        let run = resolve_telegram_run(&self.active_runs, session_id, true);
        let Some(request) = self.prepare_flush(session_id, force, run) else {
            return;
        };

        match request
            .adapter
            .send_text_progress(&request.peer_id, &request.text, request.message_id)
            .await
        {
            Ok(receipt) => {
                if let Some(state) = self.lock_tables().states.get_mut(session_id) {
                    state.message_id = Some(receipt.message_id);
                }
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "telegram stream flush failed");
            }
        }
    }

    fn prepare_flush(
        &self,
        session_id: &SessionId,
        force: bool,
        run: Option<TelegramRunView>,
    ) -> Option<FlushRequest> {
        let mut tables = self.lock_tables();
        let state = tables.states.get_mut(session_id)?;
        if state.disabled {
            return None;
        }
        if force {
            state.stop_timer();
        }
        if !state.pending {
            return None;
        }
        let run = run?;
        if run.streaming_suppressed {
            state.pending = false;
            return None;
        }
        let adapter = self.progress_adapter()?;

        let text = state.text.trim();
        if text.is_empty() {
            state.pending = false;
            return None;
        }
        let length = text.chars().count();
        let limit = adapter.max_text_length();
        if length > limit {
            state.disabled = true;
            tracing::debug!(
                session_id = %session_id,
                length,
                limit,
                "telegram stream disabled (message too long)"
            );
            return None;
        }

        state.pending = false;
        Some(FlushRequest {
            adapter,
            peer_id: run.peer_id,
            text: text.to_string(),
            message_id: state.message_id,
        })
    }
}
