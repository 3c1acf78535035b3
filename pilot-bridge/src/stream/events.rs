//! Long-lived subscription to the backend event stream.

use super::router::BridgeEventRouter;
use futures_util::StreamExt;
use pilot_opencode::OpencodeBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

fn reconnect_delay(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(6);
    RECONNECT_BASE_DELAY
        .saturating_mul(1 << exponent)
        .min(RECONNECT_MAX_DELAY)
}

pub struct BridgeEventProcessor {
    backend: Arc<dyn OpencodeBackend>,
    router: Arc<BridgeEventRouter>,
}

impl BridgeEventProcessor {
    pub fn new(backend: Arc<dyn OpencodeBackend>, router: Arc<BridgeEventRouter>) -> Self {
        Self { backend, router }
    }

    /// Consumes events until `shutdown` fires, resubscribing with backoff when
    /// the stream fails or ends.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut consecutive_failures: u32 = 0;

        loop {
            let subscription = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscription = self.backend.subscribe_events() => subscription,
            };
            match subscription {
                Ok(mut events) => {
                    tracing::info!("subscribed to backend events");
                    consecutive_failures = 0;
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            next = events.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                if let Err(error) = self.router.route(&event).await {
                                    tracing::warn!(
                                        kind = event.kind(),
                                        error = %error,
                                        "event handling failed"
                                    );
                                }
                            }
                            Some(Err(error)) => {
                                tracing::warn!(error = %error, "event stream failed");
                                break;
                            }
                            None => {
                                tracing::warn!("event stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "event subscription failed");
                }
            }

            consecutive_failures = consecutive_failures.saturating_add(1);
            let delay = reconnect_delay(consecutive_failures);
            tracing::info!(?delay, attempt = consecutive_failures, "resubscribing to backend events");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("event processor stopped");
    }
}
