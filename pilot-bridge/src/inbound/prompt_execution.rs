//! Prompting with one transparent recovery from a stale backend session.

use super::backend_errors::{is_session_not_found, normalize};
use super::session_factory::{SessionFactory, SessionReason};
use crate::store::BridgeStore;
use pilot_channels::ChannelName;
use pilot_opencode::{ModelRef, OpencodeBackend, OpencodeError, PromptRequest, PromptResponse, SessionId};
use std::sync::Arc;

const MAX_PROMPT_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecovery {
    pub previous: SessionId,
    pub next: SessionId,
}

#[derive(Debug)]
pub struct PromptOutcome {
    pub session_id: SessionId,
    pub response: PromptResponse,
}

pub struct PromptInput<'a> {
    pub channel: ChannelName,
    pub peer_id: &'a str,
    pub peer_key: &'a str,
    pub text: &'a str,
    pub session_id: SessionId,
    pub model: Option<ModelRef>,
}

pub struct PromptExecutionService {
    backend: Arc<dyn OpencodeBackend>,
    store: Arc<BridgeStore>,
    factory: Arc<SessionFactory>,
}

impl PromptExecutionService {
    pub fn new(
        backend: Arc<dyn OpencodeBackend>,
        store: Arc<BridgeStore>,
        factory: Arc<SessionFactory>,
    ) -> Self {
        Self {
            backend,
            store,
            factory,
        }
    }

    /// Prompts `input.session_id`. When the first attempt reports the session
    /// as unknown, the stored session is replaced, `on_recovered` is told
    /// about the switch, and the prompt is retried once on the new session.
    /// Any other failure, and any failure of the retry, is returned.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %input.channel, session_id = %input.session_id)
    )]
    pub async fn prompt_with_session_recovery(
        &self,
        input: PromptInput<'_>,
        mut on_recovered: impl FnMut(SessionRecovery) + Send,
    ) -> anyhow::Result<PromptOutcome> {
        let mut active = input.session_id.clone();

        for attempt in 0..MAX_PROMPT_ATTEMPTS {
            let request = PromptRequest::text(input.text, input.model.clone());
            let failure: anyhow::Error = match self.backend.prompt(&active, &request).await {
                Ok(response) => match response.info.error.clone() {
                    None => {
                        return Ok(PromptOutcome {
                            session_id: active,
                            response,
                        });
                    }
                    Some(error) => error.into_error().into(),
                },
                Err(error) => error.into(),
            };

            let stale = attempt == 0
                && normalize(&failure)
                    .is_some_and(|error| is_session_not_found(&error, Some(active.as_str())));
            if !stale {
                return Err(failure);
            }

            tracing::warn!(
                peer_id = input.peer_id,
                stale_session_id = %active,
                error = %failure,
                "stale session detected, recreating"
            );
            self.store.delete_session(input.channel, input.peer_key)?;
            let next = self
                .factory
                .create(input.channel, input.peer_key, false, SessionReason::Recovery)
                .await?;
            on_recovered(SessionRecovery {
                previous: active,
                next: next.clone(),
            });
            active = next;
        }

        Err(OpencodeError::RecoveryExhausted.into())
    }
}
