// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! The configuration is a YAML document naming the three log files, the
//! rotation interval, the scrape server settings, and the KPI table. It is
//! parsed and validated once at startup; any violation aborts the process
//! before a task starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Rotating more often than this makes the copy→truncate loss window
/// significant relative to the interval.
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub log_config: LogConfig,
    pub server: ServerConfig,
    pub kpis: Vec<Kpi>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log file written by the monitored application.
    pub source_log_file: PathBuf,
    /// Mirror maintained by the tailer, truncated each rotation.
    pub redirect_log_file: PathBuf,
    /// Snapshot produced by the rotator and scanned by the extractor.
    pub rotated_log_file: PathBuf,
    #[serde(deserialize_with = "deserialize_duration")]
    pub rotation_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub metrics_path: String,
    #[serde(default)]
    pub pushgateway: PushGatewayConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushGatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub job: String,
    #[serde(default)]
    pub instance: String,
}

/// A named regex whose match count across the latest snapshot is exposed as
/// a gauge.
#[derive(Debug, Clone, Deserialize)]
pub struct Kpi {
    pub name: String,
    pub regex: String,
    #[serde(default)]
    pub custom_labels: HashMap<String, String>,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl Config {
    /// Load and validate the configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_config.rotation_interval < MIN_ROTATION_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "rotation_interval must be at least {}, got {}",
                humantime::format_duration(MIN_ROTATION_INTERVAL),
                humantime::format_duration(self.log_config.rotation_interval),
            )));
        }

        if self.server.port == 0 {
            return Err(ConfigError::Invalid(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.server.metrics_path.is_empty() {
            return Err(ConfigError::Invalid(
                "server.metrics_path must not be empty".to_string(),
            ));
        }
        if !self.server.metrics_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.metrics_path must start with '/', got {:?}",
                self.server.metrics_path,
            )));
        }

        let push = &self.server.pushgateway;
        if push.enabled && (push.url.is_empty() || push.job.is_empty() || push.instance.is_empty())
        {
            return Err(ConfigError::Invalid(
                "pushgateway url, job, and instance must be set when the pushgateway is enabled"
                    .to_string(),
            ));
        }

        if self.kpis.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one KPI must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for kpi in &self.kpis {
            if kpi.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "KPI name must not be empty".to_string(),
                ));
            }
            if kpi.regex.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "KPI {:?} has an empty regex",
                    kpi.name
                )));
            }
            if !seen.insert(kpi.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate KPI name {:?}",
                    kpi.name
                )));
            }
        }

        Ok(())
    }
}
