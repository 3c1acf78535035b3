use dashmap::DashMap;
use pilot_channels::ChannelName;
use pilot_opencode::ModelRef;

/// Per-(channel, peer) model overrides set through slash commands.
/// Overrides live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct ModelStore {
    overrides: DashMap<(ChannelName, String), ModelRef>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The peer's override, else `fallback`.
    pub fn get(
        &self,
        channel: ChannelName,
        peer_key: &str,
        fallback: Option<&ModelRef>,
    ) -> Option<ModelRef> {
        self.overrides
            .get(&(channel, peer_key.to_string()))
            .map(|model| model.value().clone())
            .or_else(|| fallback.cloned())
    }

    pub fn set(&self, channel: ChannelName, peer_key: &str, model: ModelRef) {
        self.overrides.insert((channel, peer_key.to_string()), model);
    }

    pub fn clear(&self, channel: ChannelName, peer_key: &str) {
        self.overrides.remove(&(channel, peer_key.to_string()));
    }
}
