//! Session run registry: active runs plus a strict FIFO task chain per session.

use crate::state::run_state::{ActiveRuns, SharedRun};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use pilot_opencode::SessionId;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Resolves once the task it was taken for (and everything queued before it)
/// has finished.
pub type PendingTask = Shared<BoxFuture<'static, ()>>;

struct QueueTail {
    ticket: u64,
    done: PendingTask,
}

type SessionQueue = Arc<Mutex<HashMap<SessionId, QueueTail>>>;

pub struct SessionRunRegistry {
    active_runs: ActiveRuns,
    queue: SessionQueue,
    next_ticket: AtomicU64,
}

impl SessionRunRegistry {
    pub fn new(active_runs: ActiveRuns) -> Self {
        Self {
            active_runs,
            queue: Arc::default(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn active_runs(&self) -> ActiveRuns {
        Arc::clone(&self.active_runs)
    }

    pub fn get(&self, session_id: &str) -> Option<SharedRun> {
        self.active_runs
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn set(&self, run: SharedRun) {
        let session_id = run.session_id();
        self.active_runs.insert(session_id, run);
    }

    pub fn delete(&self, session_id: &str) {
        self.active_runs.remove(session_id);
    }

    /// Appends `task` to the session's chain. It starts only after every task
    /// previously enqueued for the same session has completed; failures and
    /// panics are logged and never break the chain.
    pub fn enqueue<F>(&self, session_id: SessionId, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        let done: PendingTask = async move {
            let _ = finished_rx.await;
        }
        .boxed()
        .shared();

        let previous = lock_queue(&self.queue).insert(
            session_id.clone(),
            QueueTail {
                ticket,
                done: done.clone(),
            },
        );

        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.done.await;
            }

            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(session_id = %session_id, error = %format!("{error:#}"), "session task failed");
                }
                Err(panic) => {
                    tracing::error!(
                        session_id = %session_id,
                        panic_payload = %crate::panic_payload_to_string(panic.as_ref()),
                        "session task panicked"
                    );
                }
            }

            {
                let mut queue = lock_queue(&queue);
                if queue
                    .get(&session_id)
                    .is_some_and(|tail| tail.ticket == ticket)
                {
                    queue.remove(&session_id);
                }
            }
            let _ = finished_tx.send(());
        });
    }

    /// The tail of the session's chain, if any task is queued or running.
    pub fn pending_task(&self, session_id: &str) -> Option<PendingTask> {
        lock_queue(&self.queue)
            .get(session_id)
            .map(|tail| tail.done.clone())
    }
}

fn lock_queue(queue: &SessionQueue) -> MutexGuard<'_, HashMap<SessionId, QueueTail>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run_state::RunState;
    use pilot_channels::ChannelName;
    use std::time::Duration;

    async fn fail() -> anyhow::Result<()> {
        Err(anyhow::anyhow!("boom"))
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("kaboom")
    }

    fn registry() -> SessionRunRegistry {
        SessionRunRegistry::new(ActiveRuns::default())
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_for_one_session_run_in_enqueue_order_without_overlap() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicU64::new(0));
        let max_running = Arc::new(AtomicU64::new(0));

        for (idx, delay_ms) in [(0_u64, 50_u64), (1, 10), (2, 30)] {
            let log = Arc::clone(&log);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            registry.enqueue(SessionId::new("ses_1"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                log.lock().unwrap().push(format!("start {idx}"));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                log.lock().unwrap().push(format!("end {idx}"));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        registry.pending_task("ses_1").expect("tail").await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert!(registry.pending_task("ses_1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_panicking_tasks_do_not_break_the_chain() {
        let registry = registry();
        let ran = Arc::new(AtomicU64::new(0));

        registry.enqueue(SessionId::new("ses_1"), fail());
        registry.enqueue(SessionId::new("ses_1"), explode());
        let counter = Arc::clone(&ran);
        registry.enqueue(SessionId::new("ses_1"), async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        registry.pending_task("ses_1").expect("tail").await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_do_not_wait_on_each_other() {
        let registry = registry();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        registry.enqueue(SessionId::new("ses_slow"), async move {
            let _ = release_rx.await;
            Ok(())
        });
        let fast_done = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&fast_done);
        registry.enqueue(SessionId::new("ses_fast"), async move {
            flag.store(1, Ordering::SeqCst);
            Ok(())
        });

        registry.pending_task("ses_fast").expect("fast tail").await;
        assert_eq!(fast_done.load(Ordering::SeqCst), 1);
        assert!(registry.pending_task("ses_slow").is_some());

        release_tx.send(()).unwrap();
        registry.pending_task("ses_slow").expect("slow tail").await;
    }

    #[test]
    fn active_runs_are_keyed_by_session_id() {
        let registry = registry();
        let run = SharedRun::new(RunState::new(
            SessionId::new("ses_1"),
            ChannelName::Telegram,
            "1",
            false,
        ));
        registry.set(run.clone());
        assert!(registry.get("ses_1").is_some_and(|found| found.ptr_eq(&run)));
        registry.delete("ses_1");
        assert!(registry.get("ses_1").is_none());
        assert!(registry.active_runs().is_empty());
    }
}
