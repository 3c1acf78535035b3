//! Settles a session once the backend reports it idle.

use super::coordinator::StreamCoordinators;
use super::hooks::ChannelHooksRegistry;
use super::typing::TypingManager;
use crate::state::run_state::{ActiveRuns, SessionModels};
use crate::support::reporting::{BridgeReporter, report_done};
use pilot_opencode::SessionId;
use std::sync::Arc;

pub struct SessionIdleHandler {
    pub(crate) active_runs: ActiveRuns,
    pub(crate) session_models: SessionModels,
    pub(crate) typing: Arc<TypingManager>,
    pub(crate) coordinators: StreamCoordinators,
    pub(crate) hooks: ChannelHooksRegistry,
    pub(crate) reporter: Arc<dyn BridgeReporter>,
}

impl SessionIdleHandler {
    /// Flushes the stream, stops typing, runs idle hooks, then reports done.
    /// Without an active run only typing is stopped.
    pub async fn handle(&self, session_id: &SessionId) {
        let Some(run) = self
            .active_runs
            .get(session_id)
            .map(|entry| entry.value().clone())
        else {
            self.typing.stop(session_id);
            return;
        };
        let channel = run.lock().channel;

        self.coordinators.get(channel).on_session_idle(session_id).await;
        self.typing.stop(session_id);
        self.hooks.get(channel).on_session_idle(&run).await;
        report_done(&mut run.lock(), &self.session_models, self.reporter.as_ref());
    }
}
