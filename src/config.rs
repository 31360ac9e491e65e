//! TOML configuration model.
//!
//! The config file drives everything that can also be changed at runtime:
//! network topology, per-channel webhook/RSS bindings, the webhook listener
//! and the RSS poller. `!reload` re-reads the same file and reconciles.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::webhook::Forge;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite database path.
    #[serde(default = "default_database")]
    pub database: String,

    /// Optional global local-bind address for outgoing IRC connections.
    /// Per-network `bind` overrides this.
    pub bind: Option<String>,

    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkConfig>,

    #[serde(default)]
    pub webhook_server: WebhookServerConfig,

    #[serde(default)]
    pub rss: RssConfig,
}

impl Config {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Network names key the reload reconciliation, so they must be unique.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for net in &self.networks {
            if !seen.insert(net.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "network.name".to_string(),
                    message: format!("duplicate network name '{}'", net.name),
                });
            }
        }
        Ok(())
    }
}

/// One IRC network. Identity key: `name`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub host: String,
    pub port: u16,

    #[serde(default)]
    pub tls: bool,

    #[serde(default = "default_true")]
    pub tls_verify: bool,

    /// Optional local bind address; overrides the global `bind`.
    pub bind: Option<String>,

    pub nickname: String,

    /// Defaults to the nickname.
    pub username: Option<String>,

    /// Defaults to the nickname.
    pub realname: Option<String>,

    pub nickserv_password: Option<String>,

    pub sasl: Option<SaslConfig>,

    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}

impl NetworkConfig {
    /// The desired channel set, lower-cased.
    pub fn channel_names(&self) -> HashSet<String> {
        self.channels.iter().map(|c| c.name.to_lowercase()).collect()
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nickname)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nickname)
    }
}

/// SASL PLAIN credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct SaslConfig {
    pub user: String,
    pub password: String,
}

/// One channel on a network, with its statically configured bindings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,

    /// RSS feed URLs delivered to this channel.
    #[serde(default)]
    pub rss: Vec<String>,

    #[serde(default, rename = "webhook")]
    pub webhooks: Vec<WebhookBinding>,
}

/// A statically configured webhook route.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookBinding {
    /// Repo identity: full name, owner, or organisation.
    pub repo: String,

    /// Event categories; defaults to ping/code/pr/issue/repo.
    pub events: Option<Vec<String>>,

    /// Branch allow-list; empty or absent means all branches.
    pub branches: Option<Vec<String>>,
}

/// Webhook listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_webhook_host")]
    pub host: String,

    #[serde(default = "default_webhook_port")]
    pub port: u16,

    /// Legacy fallback secret applied to every forge.
    pub secret: Option<String>,

    pub github_secret: Option<String>,
    pub gitea_secret: Option<String>,
    pub gitlab_secret: Option<String>,
}

impl WebhookServerConfig {
    /// Per-forge secrets, falling back to the legacy `secret` key.
    /// Forges with no secret at all are absent from the map (verification
    /// is skipped for them).
    pub fn secrets(&self) -> HashMap<Forge, String> {
        let legacy = self.secret.as_deref();
        let mut map = HashMap::new();
        for (forge, specific) in [
            (Forge::GitHub, self.github_secret.as_deref()),
            (Forge::Gitea, self.gitea_secret.as_deref()),
            (Forge::GitLab, self.gitlab_secret.as_deref()),
        ] {
            if let Some(secret) = specific.or(legacy) {
                if !secret.is_empty() {
                    map.insert(forge, secret.to_string());
                }
            }
        }
        map
    }
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_webhook_host(),
            port: default_webhook_port(),
            secret: None,
            github_secret: None,
            gitea_secret: None,
            gitlab_secret: None,
        }
    }
}

/// RSS poller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RssConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Poll interval in seconds.
    #[serde(default = "default_rss_interval")]
    pub interval: u64,
}

impl Default for RssConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_rss_interval(),
        }
    }
}

fn default_database() -> String {
    "gitbot.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_webhook_host() -> String {
    "127.0.0.1".to_string()
}

fn default_webhook_port() -> u16 {
    8080
}

fn default_rss_interval() -> u64 {
    300
}
