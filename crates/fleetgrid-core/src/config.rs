//! fleet.toml configuration parser.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:7600"
//! token = "change-me"
//!
//! [health.defaults]
//! missed_after = "15s"
//!
//! [health.platforms.velocity]
//! startup_timeout = "60s"
//!
//! [[groups]]
//! name = "lobby"
//! platform = "paper"
//! ...
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetgrid_state::{GroupSpec, Platform};
use thiserror::Error;

use crate::duration::parse_duration;

/// Errors raised while loading `fleet.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: String, value: String },

    #[error("invalid group {group}: {reason}")]
    Group { group: String, reason: String },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub health: HealthConfig,
    pub autoscaler: AutoscalerConfig,
    pub lifecycle: LifecycleConfig,
    pub groups: Vec<GroupSpec>,
}

/// Control protocol listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Shared secret agents must present in their handshake.
    pub token: Option<String>,
    pub handshake_timeout: String,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7600".to_string(),
            token: None,
            handshake_timeout: "5s".to_string(),
            outbound_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fleetgrid.redb"),
        }
    }
}

/// Health thresholds as written in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub missed_after: Option<String>,
    pub startup_timeout: Option<String>,
    pub reclaim_after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    pub defaults: ThresholdConfig,
    /// Per-platform overrides of `defaults`, keyed by platform name.
    pub platforms: BTreeMap<String, ThresholdConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            defaults: ThresholdConfig::default(),
            platforms: BTreeMap::new(),
        }
    }
}

/// Resolved health thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub missed_after: Duration,
    pub startup_timeout: Duration,
    pub reclaim_after: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            missed_after: Duration::from_secs(15),
            startup_timeout: Duration::from_secs(180),
            reclaim_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub interval: String,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// In-process runtime, for development and tests.
    #[default]
    Memory,
    /// Local Docker daemon (requires the `docker` feature of fleetd).
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub runtime: RuntimeKind,
    /// Maximum number of concurrent runtime calls.
    pub runtime_workers: usize,
    /// Deadline for a single runtime call.
    pub call_deadline: String,
    pub provision_attempts: u32,
    pub retry_backoff: String,
    pub retry_backoff_max: String,
    /// How long a draining instance may keep players before it is stopped.
    pub drain_grace: String,
    /// Grace a container gets on stop before the runtime kills it.
    pub stop_timeout: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Memory,
            runtime_workers: 4,
            call_deadline: "30s".to_string(),
            provision_attempts: 3,
            retry_backoff: "1s".to_string(),
            retry_backoff_max: "30s".to_string(),
            drain_grace: "30s".to_string(),
            stop_timeout: "10s".to_string(),
        }
    }
}

impl FleetConfig {
    /// Read, parse, and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every duration and group definition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.handshake_timeout()?;
        self.health_interval()?;
        self.autoscaler_interval()?;
        self.call_deadline()?;
        self.retry_backoff()?;
        self.retry_backoff_max()?;
        self.drain_grace()?;
        self.stop_timeout()?;
        self.thresholds(Platform::Paper)?;
        for name in self.health.platforms.keys() {
            let platform = Platform::from_name(name).ok_or_else(|| ConfigError::Invalid {
                field: format!("health.platforms.{name}"),
                reason: "unknown platform".to_string(),
            })?;
            self.thresholds(platform)?;
        }

        if self.lifecycle.runtime_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "lifecycle.runtime_workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lifecycle.provision_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "lifecycle.provision_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.server.outbound_queue == 0 {
            return Err(ConfigError::Invalid {
                field: "server.outbound_queue".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::Group {
                    group: group.name.clone(),
                    reason: "defined more than once".to_string(),
                });
            }
            group.validate().map_err(|reason| ConfigError::Group {
                group: group.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Result<Duration, ConfigError> {
        duration("server.handshake_timeout", &self.server.handshake_timeout)
    }

    pub fn health_interval(&self) -> Result<Duration, ConfigError> {
        duration("health.interval", &self.health.interval)
    }

    pub fn autoscaler_interval(&self) -> Result<Duration, ConfigError> {
        duration("autoscaler.interval", &self.autoscaler.interval)
    }

    pub fn call_deadline(&self) -> Result<Duration, ConfigError> {
        duration("lifecycle.call_deadline", &self.lifecycle.call_deadline)
    }

    pub fn retry_backoff(&self) -> Result<Duration, ConfigError> {
        duration("lifecycle.retry_backoff", &self.lifecycle.retry_backoff)
    }

    pub fn retry_backoff_max(&self) -> Result<Duration, ConfigError> {
        duration("lifecycle.retry_backoff_max", &self.lifecycle.retry_backoff_max)
    }

    pub fn drain_grace(&self) -> Result<Duration, ConfigError> {
        duration("lifecycle.drain_grace", &self.lifecycle.drain_grace)
    }

    pub fn stop_timeout(&self) -> Result<Duration, ConfigError> {
        duration("lifecycle.stop_timeout", &self.lifecycle.stop_timeout)
    }

    /// Thresholds for `platform`: built-in defaults, then `[health.defaults]`,
    /// then `[health.platforms.<platform>]`.
    pub fn thresholds(&self, platform: Platform) -> Result<Thresholds, ConfigError> {
        let mut resolved = Thresholds::default();
        apply_overrides(&mut resolved, &self.health.defaults, "health.defaults")?;
        if let Some(overrides) = self.health.platforms.get(platform.as_str()) {
            apply_overrides(&mut resolved, overrides, "health.platforms")?;
        }
        Ok(resolved)
    }
}

fn apply_overrides(
    target: &mut Thresholds,
    overrides: &ThresholdConfig,
    section: &str,
) -> Result<(), ConfigError> {
    if let Some(v) = &overrides.missed_after {
        target.missed_after = duration(&format!("{section}.missed_after"), v)?;
    }
    if let Some(v) = &overrides.startup_timeout {
        target.startup_timeout = duration(&format!("{section}.startup_timeout"), v)?;
    }
    if let Some(v) = &overrides.reclaim_after {
        target.reclaim_after = duration(&format!("{section}.reclaim_after"), v)?;
    }
    Ok(())
}

fn duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field: field.to_string(),
        value: value.to_string(),
    })
}
