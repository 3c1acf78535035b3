//! Channel access policy enforcement and the pairing-code workflow.

use crate::config::{AccessPolicy, BridgeConfig, WILDCARD_ALLOW};
use crate::inbound::access_identity::AccessIdentity;
use crate::outbound::OutboundSender;
use crate::store::BridgeStore;
use chrono::{Duration, Utc};
use pilot_channels::{ChannelName, InboundMessage, OutboundKind};
use std::sync::Arc;
use uuid::Uuid;

const PAIRING_TTL_MINUTES: i64 = 60;
const PAIRING_QUEUE_LIMIT: usize = 3;
const PAIRING_SUPPORTED_CHANNELS: [ChannelName; 6] = [
    ChannelName::Whatsapp,
    ChannelName::Telegram,
    ChannelName::Slack,
    ChannelName::Discord,
    ChannelName::Email,
    ChannelName::Qq,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    Disabled,
    NotAllowlisted,
    PairingRequired,
    PairingQueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied {
        reason: DenialReason,
        /// Pairing code shown to the user, when one was issued or reused.
        code: Option<String>,
    },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(reason: DenialReason) -> Self {
        Self::Denied { reason, code: None }
    }
}

pub struct AccessControlService {
    config: Arc<BridgeConfig>,
    store: Arc<BridgeStore>,
    outbound: Arc<dyn OutboundSender>,
}

impl AccessControlService {
    pub fn new(
        config: Arc<BridgeConfig>,
        store: Arc<BridgeStore>,
        outbound: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            config,
            store,
            outbound,
        }
    }

    /// Decides whether the message may start a turn. Denials notify the peer.
    pub async fn allow_inbound(
        &self,
        message: &InboundMessage,
        identity: &AccessIdentity,
    ) -> anyhow::Result<AccessDecision> {
        let channel = message.channel;
        let policy = self.config.access_policy(channel);
        let allow_from = self.config.allow_from(channel);
        let allow_all = allow_from.contains(WILDCARD_ALLOW);
        let is_self = channel == ChannelName::Whatsapp
            && message.from_me
            && self.config.channels.whatsapp.self_chat_mode;
        let allowed = allow_all
            || is_self
            || allow_from.contains(&identity.access_key)
            || self.store.is_allowed(channel, &identity.access_key)?;

        tracing::debug!(
            %channel,
            ?policy,
            access_key = %identity.access_key,
            allow_all,
            is_self,
            allowed,
            "channel access control check"
        );

        match policy {
            AccessPolicy::Open => return Ok(AccessDecision::Allowed),
            AccessPolicy::Disabled => {
                self.send_denied(message, policy).await;
                return Ok(AccessDecision::denied(DenialReason::Disabled));
            }
            AccessPolicy::Allowlist | AccessPolicy::Pairing if allowed => {
                return Ok(AccessDecision::Allowed);
            }
            AccessPolicy::Allowlist => {
                self.send_denied(message, policy).await;
                return Ok(AccessDecision::denied(DenialReason::NotAllowlisted));
            }
            AccessPolicy::Pairing => {}
        }

        if !PAIRING_SUPPORTED_CHANNELS.contains(&channel) {
            tracing::warn!(
                %channel,
                "pairing is not supported for this channel, fallback to allowlist"
            );
            self.send_denied(message, AccessPolicy::Allowlist).await;
            return Ok(AccessDecision::denied(DenialReason::NotAllowlisted));
        }

        self.pair(message, identity).await
    }

    async fn pair(
        &self,
        message: &InboundMessage,
        identity: &AccessIdentity,
    ) -> anyhow::Result<AccessDecision> {
        let channel = message.channel;
        let now = Utc::now();
        let pruned = self.store.prune_pairing_requests(now)?;
        if pruned > 0 {
            tracing::debug!(%channel, pruned, "pruned expired pairing requests");
        }

        let active = self
            .store
            .get_pairing_request(channel, &identity.access_key, now)?;
        let pending = self.store.list_pairing_requests(Some(channel), now)?;
        if active.is_none() && pending.len() >= PAIRING_QUEUE_LIMIT {
            tracing::info!(%channel, pending = pending.len(), "pairing queue full");
            self.notify(
                message,
                "Pairing queue full. Ask the owner to approve pending requests.",
            )
            .await;
            return Ok(AccessDecision::denied(DenialReason::PairingQueueFull));
        }

        let code = match active {
            Some(request) => request.code,
            None => {
                let code = generate_pairing_code();
                self.store.create_pairing_request(
                    channel,
                    &identity.access_key,
                    &code,
                    now,
                    Duration::minutes(PAIRING_TTL_MINUTES),
                )?;
                tracing::info!(%channel, access_key = %identity.access_key, "pairing request created");
                code
            }
        };

        self.notify(
            message,
            &format!("Pairing required. Ask the owner to approve code: {code}"),
        )
        .await;
        Ok(AccessDecision::Denied {
            reason: DenialReason::PairingRequired,
            code: Some(code),
        })
    }

    async fn send_denied(&self, message: &InboundMessage, policy: AccessPolicy) {
        let text = if message.channel == ChannelName::Whatsapp && policy == AccessPolicy::Allowlist {
            "Access denied. Ask the owner to allowlist your number."
        } else {
            "Access denied."
        };
        self.notify(message, text).await;
    }

    async fn notify(&self, message: &InboundMessage, text: &str) {
        if let Err(error) = self
            .outbound
            .send_text(message.channel, &message.peer_id, text, OutboundKind::System)
            .await
        {
            tracing::warn!(
                channel = %message.channel,
                peer_id = %message.peer_id,
                error = %error,
                "failed to send access notice"
            );
        }
    }
}

/// Six decimal digits; no collision check across channels.
fn generate_pairing_code() -> String {
    let n = Uuid::new_v4().as_u128() % 900_000 + 100_000;
    n.to_string()
}
