//! Core configuration types and loading.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::defaults::*;
use crate::connection::ConnectionConfig;
use crate::dial::{Dialer, TlsOptions};
use crate::pool::PoolConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Dialer for the configured server.
    pub fn dialer(&self) -> Dialer {
        let dialer = Dialer::new(&self.server.addr)
            .with_timeout(Duration::from_secs(self.server.dial_timeout_secs));
        match &self.server.tls {
            Some(tls) => dialer.with_tls(TlsOptions {
                server_name: tls.server_name.clone(),
                insecure_skip_verify: tls.insecure_skip_verify,
            }),
            None => dialer,
        }
    }

    /// Runtime pool settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connection: ConnectionConfig {
                nick: self.identity.nick.clone(),
                pass: self.identity.pass.clone().filter(|p| !p.is_empty()),
                read_only: self.identity.read_only,
                capabilities: self.identity.capabilities.clone(),
                initial_channels: Vec::new(),
            },
            max_channels_per_subconn: self.pool.max_channels_per_subconn,
            join_rate: Duration::from_millis(self.pool.join_rate_ms),
            prune_interval: Duration::from_secs(self.pool.prune_interval_secs),
            priority_channels: self.pool.priority_channels.clone(),
            initial_channels: self.pool.channels.clone(),
        }
    }
}

/// Chat server to dial.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// `host:port`.
    pub addr: String,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Dial with TLS when present.
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Defaults to the host part of `server.addr`.
    pub server_name: Option<String>,
    /// Accept any certificate. Test servers only.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Who the bot registers as.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub nick: String,
    /// Sent verbatim as `PASS` (e.g. `oauth:...`).
    pub pass: Option<String>,
    /// Anonymous login; outgoing chat is refused locally.
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `[pool]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_channels_per_subconn")]
    pub max_channels_per_subconn: usize,
    /// Milliseconds between joins. 0 disables throttling.
    #[serde(default = "default_join_rate_ms")]
    pub join_rate_ms: u64,
    /// Seconds between automatic prunes. 0 disables.
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default)]
    pub priority_channels: Vec<String>,
    /// Joined at startup.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_channels_per_subconn: default_max_channels_per_subconn(),
            join_rate_ms: default_join_rate_ms(),
            prune_interval_secs: default_prune_interval_secs(),
            priority_channels: Vec::new(),
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Dump Prometheus text on shutdown.
    #[serde(default)]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(
            r#"
[server]
addr = "irc.chat.twitch.tv:6667"

[identity]
nick = "justinfan123"
read_only = true
"#,
        )
        .unwrap();

        assert_eq!(config.server.dial_timeout_secs, 30);
        assert!(config.server.tls.is_none());
        assert_eq!(config.pool.max_channels_per_subconn, 50);
        assert_eq!(config.pool.join_rate_ms, 500);
        assert!(!config.metrics.enabled);

        let pool = config.pool_config();
        assert!(pool.connection.read_only);
        assert_eq!(pool.connection.pass, None);
        assert_eq!(pool.join_rate, Duration::from_millis(500));
        assert_eq!(pool.prune_interval, Duration::from_secs(300));
        assert!(!config.dialer().is_tls());
    }

    #[test]
    fn test_full_config_conversion() {
        let config: Config = toml::from_str(
            r##"
[server]
addr = "irc.chat.twitch.tv:6697"
dial_timeout_secs = 5

[server.tls]
server_name = "irc.chat.twitch.tv"

[identity]
nick = "mybot"
pass = "oauth:abc"
capabilities = ["twitch.tv/tags", "twitch.tv/commands"]

[pool]
max_channels_per_subconn = 10
join_rate_ms = 0
prune_interval_secs = 0
priority_channels = ["#important"]
channels = ["#a", "b"]

[metrics]
enabled = true
"##,
        )
        .unwrap();

        let dialer = config.dialer();
        assert!(dialer.is_tls());
        assert_eq!(dialer.addr(), "irc.chat.twitch.tv:6697");

        let pool = config.pool_config();
        assert_eq!(pool.connection.pass.as_deref(), Some("oauth:abc"));
        assert_eq!(pool.connection.capabilities.len(), 2);
        assert_eq!(pool.max_channels_per_subconn, 10);
        assert!(pool.join_rate.is_zero());
        assert!(pool.prune_interval.is_zero());
        assert_eq!(pool.initial_channels, vec!["#a", "b"]);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_missing_identity_fails_to_parse() {
        let result: Result<Config, _> = toml::from_str("[server]\naddr = \"x:1\"\n");
        assert!(result.is_err());
    }
}
