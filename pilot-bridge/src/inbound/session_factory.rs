//! Backend session creation for a channel peer.

use crate::config::PermissionMode;
use crate::outbound::OutboundSender;
use crate::store::BridgeStore;
use crate::support::reporting::{BridgeReporter, format_peer};
use pilot_channels::{ChannelName, OutboundKind};
use pilot_opencode::{CreateSessionRequest, OpencodeBackend, PermissionRule, SessionId};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionReason {
    Initial,
    Recovery,
}

impl fmt::Display for SessionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Recovery => write!(f, "recovery"),
        }
    }
}

pub struct SessionFactory {
    backend: Arc<dyn OpencodeBackend>,
    store: Arc<BridgeStore>,
    outbound: Arc<dyn OutboundSender>,
    reporter: Arc<dyn BridgeReporter>,
    permission_mode: PermissionMode,
}

impl SessionFactory {
    pub fn new(
        backend: Arc<dyn OpencodeBackend>,
        store: Arc<BridgeStore>,
        outbound: Arc<dyn OutboundSender>,
        reporter: Arc<dyn BridgeReporter>,
        permission_mode: PermissionMode,
    ) -> Self {
        Self {
            backend,
            store,
            outbound,
            reporter,
            permission_mode,
        }
    }

    /// Creates a backend session and records it for `(channel, peer_key)`.
    /// Announcing tells the peer a fresh session started.
    pub async fn create(
        &self,
        channel: ChannelName,
        peer_key: &str,
        announce: bool,
        reason: SessionReason,
    ) -> anyhow::Result<SessionId> {
        let request = CreateSessionRequest {
            title: format!("bridge {channel} {peer_key}"),
            permission: vec![PermissionRule {
                permission: "*".to_string(),
                pattern: "*".to_string(),
                action: self.permission_mode.action(),
            }],
        };
        let session = self.backend.create_session(&request).await?;
        if session.id.as_str().is_empty() {
            return Err(anyhow::anyhow!("backend returned a session without an id"));
        }

        self.store.upsert_session(channel, peer_key, &session.id)?;
        tracing::info!(
            session_id = %session.id,
            %channel,
            peer_id = peer_key,
            %reason,
            "session created"
        );

        if announce {
            self.reporter.on_status(&format!(
                "{} session created for {} (ID: {}).",
                channel.label(),
                format_peer(channel, peer_key),
                session.id
            ));
            self.outbound
                .send_text(channel, peer_key, "\u{1F9ED} Session started.", OutboundKind::System)
                .await?;
        }
        Ok(session.id)
    }
}
