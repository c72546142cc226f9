//! Configuration schema and loading.
//!
//! TOML on disk, every field defaulted, environment variables layered
//! on top of whatever the file provides.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{ClusterState, Peer, PeerRole};
use crate::command::DEFAULT_TIMEOUT_MS;
use crate::pool::IDLE_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub command: CommandConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    /// Fallback per-command deadline when the request carries no
    /// `timeout` header, in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle window before a pooled socket is reaped, in seconds.
    pub idle_timeout_secs: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: IDLE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One peer as configured; roles are discovered at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    pub name: String,
    #[serde(default)]
    pub command_address: String,
}

impl Config {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Build the initial cluster snapshot for the configured peers.
    /// Every peer starts out searching until the replication subsystem
    /// reports otherwise.
    pub fn cluster_state(&self) -> ClusterState {
        ClusterState::new(
            self.peers
                .iter()
                .map(|peer| {
                    Arc::new(Peer::new(
                        peer.name.clone(),
                        PeerRole::Searching,
                        peer.command_address.clone(),
                    ))
                })
                .collect(),
        )
    }
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

fn apply_overrides_from(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(level) = var("BELLWETHER_LOG") {
        config.logging.level = level;
    }
    if let Some(value) = var("BELLWETHER_COMMAND_TIMEOUT_MS") {
        match value.parse() {
            Ok(ms) => config.command.default_timeout_ms = ms,
            Err(_) => tracing::warn!("ignoring non-numeric BELLWETHER_COMMAND_TIMEOUT_MS {value:?}"),
        }
    }
    if let Some(value) = var("BELLWETHER_POOL_IDLE_SECS") {
        match value.parse() {
            Ok(secs) => config.pool.idle_timeout_secs = secs,
            Err(_) => tracing::warn!("ignoring non-numeric BELLWETHER_POOL_IDLE_SECS {value:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("bellwether.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.command.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.pool.idle_timeout(), IDLE_TIMEOUT);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bellwether.toml");
        std::fs::write(
            &path,
            r#"
[command]
default_timeout_ms = 5000

[[peers]]
name = "db1"
command_address = "10.0.0.1:9500"

[[peers]]
name = "db2"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.command.default_timeout_ms, 5_000);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].command_address, "10.0.0.1:9500");
        assert_eq!(config.peers[1].command_address, "");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bellwether.toml");
        std::fs::write(&path, "command = 'not a table'").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn env_overrides_layer_on_top() {
        let mut env = BTreeMap::new();
        env.insert("BELLWETHER_LOG", "debug");
        env.insert("BELLWETHER_COMMAND_TIMEOUT_MS", "2500");
        env.insert("BELLWETHER_POOL_IDLE_SECS", "not-a-number");

        let mut config = Config::default();
        apply_overrides_from(&mut config, |name| {
            env.get(name).map(|value| value.to_string())
        });
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.command.default_timeout_ms, 2_500);
        // The unparseable override is ignored, not adopted as zero.
        assert_eq!(config.pool.idle_timeout_secs, IDLE_TIMEOUT.as_secs());
    }

    #[test]
    fn cluster_state_starts_peers_searching() {
        let mut config = Config::default();
        config.peers.push(PeerConfig {
            name: "db1".to_string(),
            command_address: "10.0.0.1:9500".to_string(),
        });
        let cluster = config.cluster_state();
        assert_eq!(cluster.peers().len(), 1);
        assert_eq!(cluster.peers()[0].role(), PeerRole::Searching);
        assert!(cluster.leader_command_address().is_none());
    }
}
