//! Konfigurationsstrukturen für den Sync-Client.
//!
//! Jede Sektion hat eine `Default`-Implementierung, und `#[serde(default)]`
//! erlaubt TOML-Dateien, nur die gewünschten Werte zu setzen. Zeitangaben
//! stehen in Millisekunden.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::keys;

/// Fehler beim Laden der Konfiguration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

/// Cadence of the shared-state replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Fixed flush period of pending local changes.
    pub publish_interval_ms: u64,
    /// Upper bound for the final flush when a session closes.
    pub close_flush_timeout_ms: u64,
    /// Stamp the update index at least this often, even without local changes.
    pub keepalive_interval_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 1000 / 30,
            close_flush_timeout_ms: 1_000,
            keepalive_interval_ms: 1_000,
        }
    }
}

impl StateConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn close_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.close_flush_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Stale-peer eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Key prefixes owned per peer (`<prefix>.<token>`).
    pub prefixes: Vec<String>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            sweep_interval_ms: 250,
            prefixes: vec![
                keys::UPDATE_INDEX_PREFIX.to_owned(),
                keys::AVATAR_PREFIX.to_owned(),
                keys::PLAY_AREA_PREFIX.to_owned(),
            ],
        }
    }
}

impl ReaperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Connection health counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub window_ms: u64,
    /// Publish own health under `report.connection.health.<token>`.
    pub report_to_state: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            report_to_state: false,
        }
    }
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Background runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

/// Clientseitige Sync-Konfiguration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSyncConfig {
    pub state: StateConfig,
    pub reaper: ReaperConfig,
    pub health: HealthConfig,
    pub runtime: RuntimeConfig,
}

impl ClientSyncConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state.publish_interval_ms == 0 {
            return Err(ConfigError::Invalid("state.publish_interval_ms must be > 0"));
        }
        if self.reaper.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("reaper.sweep_interval_ms must be > 0"));
        }
        if self.health.window_ms == 0 {
            return Err(ConfigError::Invalid("health.window_ms must be > 0"));
        }
        if self.runtime.worker_threads == 0 {
            return Err(ConfigError::Invalid("runtime.worker_threads must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = ClientSyncConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientSyncConfig::default());
        assert_eq!(config.state.publish_interval(), Duration::from_millis(33));
        assert_eq!(config.reaper.timeout(), Duration::from_secs(10));
        assert_eq!(
            config.reaper.prefixes,
            vec!["update.index", "avatar", "playarea"]
        );
    }

    #[test]
    fn partial_sections_override() {
        let config = ClientSyncConfig::from_toml_str(
            r#"
            [state]
            publish_interval_ms = 50

            [health]
            report_to_state = true
            "#,
        )
        .unwrap();
        assert_eq!(config.state.publish_interval_ms, 50);
        assert_eq!(config.state.close_flush_timeout_ms, 1_000);
        assert!(config.health.report_to_state);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ClientSyncConfig::from_toml_str("[state]\npublish_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nworker_threads = 4").unwrap();

        let config = ClientSyncConfig::load(file.path()).unwrap();
        assert_eq!(config.runtime.worker_threads, 4);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ClientSyncConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
