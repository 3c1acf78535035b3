//! Bridge configuration loader: TOML file plus environment overrides.

use crate::inbound::access_identity::normalize_whatsapp_id;
use pilot_channels::ChannelName;
use pilot_opencode::{ModelRef, PermissionAction};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_OPENCODE_URL: &str = "http://127.0.0.1:4096";
const DEFAULT_TOOL_OUTPUT_LIMIT: usize = 1200;
const DEFAULT_STREAM_FLUSH_MS: u64 = 300;
const DEFAULT_MAX_ROLE_ENTRIES: usize = 64;
pub const WILDCARD_ALLOW: &str = "*";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub opencode: OpencodeConfig,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpencodeConfig {
    #[serde(default = "default_opencode_url")]
    pub url: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for OpencodeConfig {
    fn default() -> Self {
        Self {
            url: default_opencode_url(),
            directory: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Global default model as `provider/model`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub tool_updates_enabled: bool,
    #[serde(default = "default_tool_output_limit")]
    pub tool_output_limit: usize,
    #[serde(default = "default_stream_flush_ms")]
    pub stream_flush_ms: u64,
    #[serde(default = "default_max_role_entries")]
    pub max_role_entries_per_session: usize,
    #[serde(default)]
    pub groups_enabled: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_path: None,
            model: None,
            permission_mode: PermissionMode::default(),
            tool_updates_enabled: false,
            tool_output_limit: DEFAULT_TOOL_OUTPUT_LIMIT,
            stream_flush_ms: DEFAULT_STREAM_FLUSH_MS,
            max_role_entries_per_session: DEFAULT_MAX_ROLE_ENTRIES,
            groups_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    #[default]
    Allow,
    Deny,
}

impl PermissionMode {
    pub fn action(&self) -> PermissionAction {
        match self {
            Self::Allow => PermissionAction::Allow,
            Self::Deny => PermissionAction::Deny,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPolicy {
    Open,
    Allowlist,
    Pairing,
    Disabled,
}

impl FromStr for AccessPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "allowlist" => Ok(Self::Allowlist),
            "pairing" => Ok(Self::Pairing),
            "disabled" => Ok(Self::Disabled),
            other => Err(anyhow::anyhow!(
                "unknown access policy {other:?}; expected open, allowlist, pairing or disabled"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelegramThinkingMode {
    #[default]
    Off,
    Summary,
    RawDebug,
}

impl FromStr for TelegramThinkingMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "summary" => Ok(Self::Summary),
            "raw_debug" => Ok(Self::RawDebug),
            other => Err(anyhow::anyhow!(
                "unknown telegram thinking mode {other:?}; expected off, summary or raw_debug"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelAccessConfig {
    #[serde(default)]
    pub access_policy: Option<AccessPolicy>,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub thinking_mode: TelegramThinkingMode,
    #[serde(flatten)]
    pub access: ChannelAccessConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsappConfig {
    #[serde(default)]
    pub self_chat_mode: bool,
    #[serde(flatten)]
    pub access: ChannelAccessConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub whatsapp: WhatsappConfig,
    #[serde(default)]
    pub slack: ChannelAccessConfig,
    #[serde(default)]
    pub feishu: ChannelAccessConfig,
    #[serde(default)]
    pub discord: ChannelAccessConfig,
    #[serde(default)]
    pub dingtalk: ChannelAccessConfig,
    #[serde(default)]
    pub email: ChannelAccessConfig,
    #[serde(default)]
    pub mochat: ChannelAccessConfig,
    #[serde(default)]
    pub qq: ChannelAccessConfig,
}

impl ChannelsConfig {
    pub fn access(&self, channel: ChannelName) -> &ChannelAccessConfig {
        match channel {
            ChannelName::Telegram => &self.telegram.access,
            ChannelName::Whatsapp => &self.whatsapp.access,
            ChannelName::Slack => &self.slack,
            ChannelName::Feishu => &self.feishu,
            ChannelName::Discord => &self.discord,
            ChannelName::Dingtalk => &self.dingtalk,
            ChannelName::Email => &self.email,
            ChannelName::Mochat => &self.mochat,
            ChannelName::Qq => &self.qq,
        }
    }

    fn access_mut(&mut self, channel: ChannelName) -> &mut ChannelAccessConfig {
        match channel {
            ChannelName::Telegram => &mut self.telegram.access,
            ChannelName::Whatsapp => &mut self.whatsapp.access,
            ChannelName::Slack => &mut self.slack,
            ChannelName::Feishu => &mut self.feishu,
            ChannelName::Discord => &mut self.discord,
            ChannelName::Dingtalk => &mut self.dingtalk,
            ChannelName::Email => &mut self.email,
            ChannelName::Mochat => &mut self.mochat,
            ChannelName::Qq => &mut self.qq,
        }
    }
}

impl BridgeConfig {
    /// Loads `path`, or the default location. A missing default file yields
    /// the built-in defaults; a missing explicit path is an error.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("OPENCODE_URL") {
            self.opencode.url = v;
        }
        if let Some(v) = var("OPENCODE_DIRECTORY") {
            self.opencode.directory = Some(v);
        }
        if let Some(v) = var("OPENCODE_SERVER_USERNAME") {
            self.opencode.username = Some(v);
        }
        if let Some(v) = var("OPENCODE_SERVER_PASSWORD") {
            self.opencode.password = Some(v);
        }
        if let Some(v) = var("BRIDGE_DATA_DIR") {
            self.bridge.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("BRIDGE_DB_PATH") {
            self.bridge.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("BRIDGE_MODEL") {
            self.bridge.model = Some(v);
        }
        if let Some(v) = var("PERMISSION_MODE") {
            self.bridge.permission_mode = if v.eq_ignore_ascii_case("deny") {
                PermissionMode::Deny
            } else {
                PermissionMode::Allow
            };
        }
        if let Some(v) = var("TOOL_UPDATES_ENABLED") {
            self.bridge.tool_updates_enabled = parse_bool("TOOL_UPDATES_ENABLED", &v)?;
        }
        if let Some(v) = var("TOOL_OUTPUT_LIMIT") {
            self.bridge.tool_output_limit = v
                .parse()
                .map_err(|e| anyhow::anyhow!("TOOL_OUTPUT_LIMIT={v:?}: {e}"))?;
        }
        if let Some(v) = var("GROUPS_ENABLED") {
            self.bridge.groups_enabled = parse_bool("GROUPS_ENABLED", &v)?;
        }
        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = var("TELEGRAM_ENABLED") {
            self.channels.telegram.enabled = parse_bool("TELEGRAM_ENABLED", &v)?;
        }
        if let Some(v) = var("TELEGRAM_THINKING_MODE") {
            self.channels.telegram.thinking_mode = v.parse()?;
        }
        if let Some(v) = var("WHATSAPP_SELF_CHAT") {
            self.channels.whatsapp.self_chat_mode = parse_bool("WHATSAPP_SELF_CHAT", &v)?;
        }

        for channel in ChannelName::ALL {
            let upper = channel.as_str().to_ascii_uppercase();
            if let Some(v) = var(&format!("ACCESS_POLICY_{upper}")) {
                self.channels.access_mut(channel).access_policy = Some(v.parse()?);
            }
            if let Some(v) = var(&format!("ALLOW_FROM_{upper}")) {
                self.channels
                    .access_mut(channel)
                    .allow_from
                    .extend(parse_list(&v));
            }
        }

        // ALLOW_FROM entries are either `channel:peer` or a bare peer for every channel.
        if let Some(v) = var("ALLOW_FROM") {
            for entry in parse_list(&v) {
                match entry.split_once(':') {
                    Some((channel, peer)) if channel.parse::<ChannelName>().is_ok() => {
                        if let Ok(channel) = channel.parse::<ChannelName>() {
                            let peer = peer.trim();
                            if !peer.is_empty() {
                                self.channels.access_mut(channel).allow_from.push(peer.to_string());
                            }
                        }
                    }
                    _ => {
                        for channel in ChannelName::ALL {
                            self.channels.access_mut(channel).allow_from.push(entry.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.opencode.url.trim().is_empty() {
            return Err(anyhow::anyhow!("opencode.url is required"));
        }
        if self.bridge.stream_flush_ms == 0 {
            return Err(anyhow::anyhow!("bridge.stream_flush_ms must be > 0"));
        }
        if self.bridge.max_role_entries_per_session == 0 {
            return Err(anyhow::anyhow!(
                "bridge.max_role_entries_per_session must be > 0"
            ));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        if let Some(model) = self.bridge.model.as_deref() {
            if ModelRef::parse(model).is_none() {
                return Err(anyhow::anyhow!(
                    "bridge.model must look like provider/model, got {model:?}"
                ));
            }
        }
        Ok(())
    }

    pub fn access_policy(&self, channel: ChannelName) -> AccessPolicy {
        self.channels
            .access(channel)
            .access_policy
            .unwrap_or(match channel {
                ChannelName::Whatsapp => AccessPolicy::Pairing,
                _ => AccessPolicy::Open,
            })
    }

    /// Configured allow entries for a channel. WhatsApp entries are normalized
    /// to canonical phone form; `*` is kept as the wildcard.
    pub fn allow_from(&self, channel: ChannelName) -> HashSet<String> {
        self.channels
            .access(channel)
            .allow_from
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| match channel {
                ChannelName::Whatsapp if entry != WILDCARD_ALLOW => normalize_whatsapp_id(entry),
                _ => entry.to_string(),
            })
            .collect()
    }

    pub fn default_model(&self) -> Option<ModelRef> {
        self.bridge.model.as_deref().and_then(ModelRef::parse)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.bridge
            .data_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(default_data_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.bridge
            .db_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.data_dir().join("bridge.db"))
    }
}

fn default_opencode_url() -> String {
    DEFAULT_OPENCODE_URL.to_string()
}

fn default_tool_output_limit() -> usize {
    DEFAULT_TOOL_OUTPUT_LIMIT
}

fn default_stream_flush_ms() -> u64 {
    DEFAULT_STREAM_FLUSH_MS
}

fn default_max_role_entries() -> usize {
    DEFAULT_MAX_ROLE_ENTRIES
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("{key}={other:?} is not a boolean")),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

pub fn default_config_path() -> PathBuf {
    home_dir().join(".pilot-bridge").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    home_dir().join(".pilot-bridge").join("data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_to_an_empty_file() {
        let cfg = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.opencode.url, "http://127.0.0.1:4096");
        assert_eq!(cfg.bridge.tool_output_limit, 1200);
        assert_eq!(cfg.bridge.stream_flush_ms, 300);
        assert_eq!(cfg.bridge.max_role_entries_per_session, 64);
        assert_eq!(cfg.bridge.permission_mode, PermissionMode::Allow);
        assert_eq!(cfg.access_policy(ChannelName::Telegram), AccessPolicy::Open);
        assert_eq!(cfg.access_policy(ChannelName::Whatsapp), AccessPolicy::Pairing);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_channel_sections() {
        let cfg = BridgeConfig::from_toml_str(
            r#"
            [opencode]
            url = "http://localhost:5000"
            directory = "/work"

            [bridge]
            model = "anthropic/claude-sonnet-4-5"
            permission_mode = "deny"
            tool_updates_enabled = true

            [channels.telegram]
            enabled = true
            bot_token = "123:abc"
            access_policy = "allowlist"
            thinking_mode = "raw_debug"
            allow_from = ["42"]

            [channels.whatsapp]
            allow_from = ["15551234567@s.whatsapp.net", "*"]
            self_chat_mode = true
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.opencode.directory.as_deref(), Some("/work"));
        assert_eq!(cfg.default_model().unwrap().model_id, "claude-sonnet-4-5");
        assert_eq!(cfg.bridge.permission_mode.action(), PermissionAction::Deny);
        assert_eq!(cfg.access_policy(ChannelName::Telegram), AccessPolicy::Allowlist);
        assert_eq!(cfg.channels.telegram.thinking_mode, TelegramThinkingMode::RawDebug);
        assert!(cfg.allow_from(ChannelName::Telegram).contains("42"));
        let whatsapp = cfg.allow_from(ChannelName::Whatsapp);
        assert!(whatsapp.contains("+15551234567"));
        assert!(whatsapp.contains("*"));
        assert!(cfg.channels.whatsapp.self_chat_mode);
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = BridgeConfig::from_toml_str(
            r#"
            [channels.slack]
            access_policy = "open"
            "#,
        )
        .unwrap();
        cfg.apply_env_overrides(env(&[
            ("OPENCODE_URL", "http://remote:4096"),
            ("TELEGRAM_BOT_TOKEN", "t0ken"),
            ("PERMISSION_MODE", "DENY"),
            ("ACCESS_POLICY_SLACK", "pairing"),
            ("ALLOW_FROM", "telegram:7, everyone"),
            ("TOOL_OUTPUT_LIMIT", "50"),
        ]))
        .unwrap();

        assert_eq!(cfg.opencode.url, "http://remote:4096");
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.bridge.permission_mode, PermissionMode::Deny);
        assert_eq!(cfg.access_policy(ChannelName::Slack), AccessPolicy::Pairing);
        assert_eq!(cfg.bridge.tool_output_limit, 50);
        let telegram = cfg.allow_from(ChannelName::Telegram);
        assert!(telegram.contains("7"));
        assert!(telegram.contains("everyone"));
        assert!(cfg.allow_from(ChannelName::Qq).contains("everyone"));
        assert!(!cfg.allow_from(ChannelName::Qq).contains("7"));
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let mut cfg = BridgeConfig::default();
        assert!(cfg
            .apply_env_overrides(env(&[("ACCESS_POLICY_TELEGRAM", "sometimes")]))
            .is_err());
        let mut cfg = BridgeConfig::default();
        assert!(cfg
            .apply_env_overrides(env(&[("TOOL_UPDATES_ENABLED", "maybe")]))
            .is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut cfg = BridgeConfig::default();
        cfg.channels.telegram.enabled = true;
        assert!(cfg.validate().is_err());

        let mut cfg = BridgeConfig::default();
        cfg.bridge.model = Some("just-a-model".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = BridgeConfig::default();
        cfg.bridge.stream_flush_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn db_path_defaults_under_data_dir() {
        let mut cfg = BridgeConfig::default();
        cfg.bridge.data_dir = Some(PathBuf::from("/var/lib/pilot"));
        assert_eq!(cfg.db_path(), PathBuf::from("/var/lib/pilot/bridge.db"));
        cfg.bridge.db_path = Some(PathBuf::from("/tmp/other.db"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/other.db"));
    }

    #[tokio::test]
    async fn load_reads_an_explicit_file_and_errors_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[bridge]\nstream_flush_ms = 120\n")
            .await
            .unwrap();
        let cfg = BridgeConfig::load(Some(path)).await.unwrap();
        assert_eq!(cfg.bridge.stream_flush_ms, 120);

        assert!(BridgeConfig::load(Some(dir.path().join("missing.toml")))
            .await
            .is_err());
    }
}
