//! ---
//! bus_section: "01-core-functionality"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Shared primitives and utilities for the bus runtime."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_resident_state_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_offline_queue_limit() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    256
}

fn default_call_timeout() -> Duration {
    Duration::from_millis(2000)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for a bus instance.
///
/// Constructed once at startup and handed by reference to the client,
/// RPC and publisher constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub instance_name: String,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`BusConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedBusConfig {
    pub config: BusConfig,
    pub source: PathBuf,
}

impl BusConfig {
    pub const ENV_CONFIG_PATH: &str = "R_BUS_CONFIG";

    /// Build a configuration with defaults for every section.
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            client: ClientConfig::default(),
            rpc: RpcConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from disk, respecting the `R_BUS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedBusConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedBusConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedBusConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<BusConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        let name = self.instance_name.trim();
        if name.is_empty() {
            return Err(anyhow!("instance_name must not be empty"));
        }
        if name.contains(['/', '+', '#']) {
            return Err(anyhow!(
                "instance_name '{}' must not contain topic separators or wildcards",
                self.instance_name
            ));
        }
        self.rpc.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for BusConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: BusConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection behaviour of the bus client.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long resident-state clearing listens for stale retained entries.
    #[serde(default = "default_resident_state_grace")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub resident_state_grace: Duration,
    /// Publishes buffered while offline; zero rejects offline publishes.
    #[serde(default = "default_offline_queue_limit")]
    pub offline_queue_limit: usize,
    /// Capacity of the client and presence event channels.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resident_state_grace: default_resident_state_grace(),
            offline_queue_limit: default_offline_queue_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_call_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub call_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: default_call_timeout(),
        }
    }
}

impl RpcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(anyhow!("rpc.call_timeout must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: BusConfig = "instance_name = \"controller-a\"".parse().expect("parse");
        assert_eq!(config.instance_name, "controller-a");
        assert_eq!(config.rpc.call_timeout, Duration::from_millis(2000));
        assert_eq!(config.client.resident_state_grace, Duration::from_millis(500));
        assert_eq!(config.client.offline_queue_limit, 1024);
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }

    #[test]
    fn parses_durations_in_milliseconds() {
        let config: BusConfig = r#"
            instance_name = "ui"

            [client]
            resident_state_grace = 25
            offline_queue_limit = 0

            [rpc]
            call_timeout = 150

            [logging]
            format = "pretty"
        "#
        .parse()
        .expect("parse");
        assert_eq!(config.client.resident_state_grace, Duration::from_millis(25));
        assert_eq!(config.client.offline_queue_limit, 0);
        assert_eq!(config.rpc.call_timeout, Duration::from_millis(150));
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_wildcards_in_instance_name() {
        let err = "instance_name = \"a/+\"".parse::<BusConfig>().unwrap_err();
        assert!(err.to_string().contains("wildcards"));
        assert!("instance_name = \"  \"".parse::<BusConfig>().is_err());
    }

    #[test]
    fn rejects_zero_rpc_timeout() {
        let mut config = BusConfig::new("a");
        config.rpc.call_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
