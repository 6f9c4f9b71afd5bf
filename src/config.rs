use crate::triggers::DEFAULT_TRIGGERS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationMode {
    /// Hide matches locally. No queue, no network, no host-visible action.
    #[default]
    View,
    /// Highlight matches for a human moderator.
    Label,
    /// Delete the message.
    Remove,
    /// Ban the sender, falling back to deleting the message.
    Exclude,
}

impl fmt::Display for ModerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModerationMode::View => "view",
            ModerationMode::Label => "label",
            ModerationMode::Remove => "remove",
            ModerationMode::Exclude => "exclude",
        };
        f.write_str(name)
    }
}

/// Persisted marker that the host's edge protection blocked our requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFlag {
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ModerationMode,
    #[serde(default = "default_trigger_rules")]
    pub trigger_rules: Vec<String>,
    #[serde(default)]
    pub network_blocked: Option<BlockFlag>,
}

fn default_enabled() -> bool {
    true
}

fn default_trigger_rules() -> Vec<String> {
    DEFAULT_TRIGGERS.iter().map(|s| s.to_string()).collect()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enabled: default_enabled(),
            mode: ModerationMode::default(),
            trigger_rules: default_trigger_rules(),
            network_blocked: None,
        }
    }
}

/// Where and how to reach the host's moderation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Base URL of the host API. Without it only UI automation is used.
    pub api_base: Option<String>,
    pub room_id: Option<String>,
    /// Raw `Cookie` header value of a logged-in moderator session.
    pub session_cookie: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_user_agent() -> String {
    format!("chat-automod/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_seconds() -> u64 {
    8
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            api_base: None,
            room_id: None,
            session_cookie: None,
            user_agent: default_user_agent(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl HostConfig {
    pub fn network_configured(&self) -> bool {
        self.api_base.is_some() && self.room_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub host: HostConfig,
    /// Label of the reason entry picked in the UI ban submenu.
    #[serde(default = "default_ban_reason_label")]
    pub ban_reason_label: String,
}

fn default_ban_reason_label() -> String {
    "Spam".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            settings: Settings::default(),
            host: HostConfig::default(),
            ban_reason_label: default_ban_reason_label(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load `path`, or fall back to defaults when it does not exist.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            log::warn!("Configuration file {path} not found, using defaults");
            Ok(Config::default())
        }
    }
}
