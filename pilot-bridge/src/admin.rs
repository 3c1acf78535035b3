//! Operator commands against the durable store: pairing review and the
//! allowlist.

use crate::store::{BridgeStore, PairingRequest};
use anyhow::Result;
use chrono::{DateTime, Utc};
use pilot_channels::ChannelName;

pub fn list_pairing(
    store: &BridgeStore,
    channel: Option<ChannelName>,
    now: DateTime<Utc>,
) -> Result<Vec<PairingRequest>> {
    store.list_pairing_requests(channel, now)
}

/// Resolves the channel a code belongs to. Without an explicit channel the
/// code must match exactly one pending request.
fn resolve_channel(
    store: &BridgeStore,
    code: &str,
    channel: Option<ChannelName>,
    now: DateTime<Utc>,
) -> Result<ChannelName> {
    if let Some(channel) = channel {
        return Ok(channel);
    }
    let matches = store.find_pairing_requests_by_code(code, now)?;
    match matches.as_slice() {
        [] => Err(anyhow::anyhow!("no pending pairing request with code {code}")),
        [request] => Ok(request.channel),
        many => Err(anyhow::anyhow!(
            "code {code} is pending on {} channels ({}); pass --channel",
            many.len(),
            many.iter()
                .map(|request| request.channel.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )),
    }
}

pub fn approve_pairing(
    store: &BridgeStore,
    code: &str,
    channel: Option<ChannelName>,
    now: DateTime<Utc>,
) -> Result<PairingRequest> {
    let channel = resolve_channel(store, code, channel, now)?;
    let approved = store
        .approve_pairing_request(channel, code, now)?
        .ok_or_else(|| anyhow::anyhow!("no pending {channel} pairing request with code {code}"))?;
    tracing::info!(%channel, peer_id = %approved.peer_id, "pairing request approved");
    Ok(approved)
}

pub fn deny_pairing(
    store: &BridgeStore,
    code: &str,
    channel: Option<ChannelName>,
    now: DateTime<Utc>,
) -> Result<ChannelName> {
    let channel = resolve_channel(store, code, channel, now)?;
    if !store.deny_pairing_request(channel, code)? {
        return Err(anyhow::anyhow!("no pending {channel} pairing request with code {code}"));
    }
    tracing::info!(%channel, code, "pairing request denied");
    Ok(channel)
}

pub fn allow_peer(store: &BridgeStore, channel: ChannelName, peer_id: &str) -> Result<()> {
    let peer_id = peer_id.trim();
    if peer_id.is_empty() {
        return Err(anyhow::anyhow!("peer id must not be empty"));
    }
    store.allow_peer(channel, peer_id)?;
    tracing::info!(%channel, peer_id, "peer added to allowlist");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_requests() -> (BridgeStore, DateTime<Utc>) {
        let store = BridgeStore::open_in_memory().unwrap();
        let now = Utc::now();
        let ttl = Duration::minutes(60);
        store
            .create_pairing_request(ChannelName::Whatsapp, "15550001111", "123456", now, ttl)
            .unwrap();
        store
            .create_pairing_request(ChannelName::Telegram, "42", "123456", now, ttl)
            .unwrap();
        store
            .create_pairing_request(ChannelName::Telegram, "43", "654321", now, ttl)
            .unwrap();
        (store, now)
    }

    #[test]
    fn approving_a_unique_code_allows_the_peer() {
        let (store, now) = store_with_requests();
        let approved = approve_pairing(&store, "654321", None, now).unwrap();
        assert_eq!(approved.channel, ChannelName::Telegram);
        assert!(store.is_allowed(ChannelName::Telegram, "43").unwrap());
        assert_eq!(list_pairing(&store, Some(ChannelName::Telegram), now).unwrap().len(), 1);
    }

    #[test]
    fn ambiguous_codes_need_a_channel() {
        let (store, now) = store_with_requests();
        let error = approve_pairing(&store, "123456", None, now).unwrap_err();
        assert!(error.to_string().contains("pass --channel"));

        approve_pairing(&store, "123456", Some(ChannelName::Whatsapp), now).unwrap();
        assert!(store.is_allowed(ChannelName::Whatsapp, "15550001111").unwrap());
        assert!(!store.is_allowed(ChannelName::Telegram, "42").unwrap());
    }

    #[test]
    fn denying_removes_the_request_without_allowing() {
        let (store, now) = store_with_requests();
        assert_eq!(
            deny_pairing(&store, "654321", None, now).unwrap(),
            ChannelName::Telegram
        );
        assert!(!store.is_allowed(ChannelName::Telegram, "43").unwrap());
        assert!(deny_pairing(&store, "654321", None, now).is_err());
    }

    #[test]
    fn blank_peers_are_rejected() {
        let store = BridgeStore::open_in_memory().unwrap();
        assert!(allow_peer(&store, ChannelName::Slack, "  ").is_err());
        allow_peer(&store, ChannelName::Slack, " U1 ").unwrap();
        assert!(store.is_allowed(ChannelName::Slack, "U1").unwrap());
    }
}
