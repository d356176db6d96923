//! Relay configuration.
//!
//! Configuration is resolved in three layers: compiled-in defaults, an
//! optional YAML file named by `CONFIG_PATH`, and per-option environment
//! overrides (`RELAY_*`). The merged result is validated before use.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// gRPC listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::server_port")]
    pub port: u16,
    /// Per-RPC deadline applied to each proxied call.
    #[serde(default = "defaults::proxy_timeout", with = "duration_str")]
    pub proxy_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::server_port(),
            proxy_timeout: defaults::proxy_timeout(),
        }
    }
}

/// Worker pool settings. Worker `i` (1-based) listens on
/// `start_port + i - 1` and exposes metrics on `start_port + i - 1 + 100`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    #[serde(default = "defaults::workers_count")]
    pub count: u16,
    #[serde(default = "defaults::workers_start_port")]
    pub start_port: u16,
    #[serde(default = "defaults::metrics_path")]
    pub metrics_path: String,
    /// Connections per worker; matches the worker's request concurrency.
    #[serde(default = "defaults::pool_size")]
    pub pool_size: u16,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: defaults::workers_count(),
            start_port: defaults::workers_start_port(),
            metrics_path: defaults::metrics_path(),
            pool_size: defaults::pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default = "defaults::health_interval", with = "duration_str")]
    pub interval: Duration,
    #[serde(default = "defaults::health_timeout", with = "duration_str")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: defaults::health_interval(),
            timeout: defaults::health_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbesConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::probes_port")]
    pub port: u16,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            port: defaults::probes_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::metrics_port")]
    pub port: u16,
    #[serde(default = "defaults::metrics_path")]
    pub path: String,
    #[serde(default = "defaults::metrics_interval", with = "duration_str")]
    pub interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            port: defaults::metrics_port(),
            path: defaults::metrics_path(),
            interval: defaults::metrics_interval(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn host() -> String {
        "0.0.0.0".to_string()
    }
    pub fn server_port() -> u16 {
        8080
    }
    pub fn proxy_timeout() -> Duration {
        Duration::from_secs(30)
    }
    pub fn workers_count() -> u16 {
        2
    }
    pub fn workers_start_port() -> u16 {
        9000
    }
    pub fn metrics_path() -> String {
        "/metrics".to_string()
    }
    pub fn pool_size() -> u16 {
        5
    }
    pub fn health_interval() -> Duration {
        Duration::from_secs(5)
    }
    pub fn health_timeout() -> Duration {
        Duration::from_secs(3)
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn probes_port() -> u16 {
        5555
    }
    pub fn metrics_port() -> u16 {
        9394
    }
    pub fn metrics_interval() -> Duration {
        Duration::from_secs(5)
    }
}

impl Config {
    /// Resolve the configuration: defaults, then the YAML file named by
    /// `CONFIG_PATH` (if set), then `RELAY_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CONFIG_PATH") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file. Missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `RELAY_*` environment overrides on top of the current values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_parse("RELAY_LOG_LEVEL", &mut self.log.level)?;
        override_parse("RELAY_LOG_FORMAT", &mut self.log.format)?;
        override_string("RELAY_SERVER_HOST", &mut self.server.host);
        override_parse("RELAY_SERVER_PORT", &mut self.server.port)?;
        override_duration("RELAY_SERVER_PROXY_TIMEOUT", &mut self.server.proxy_timeout)?;
        override_parse("RELAY_WORKERS_COUNT", &mut self.workers.count)?;
        override_parse("RELAY_WORKERS_START_PORT", &mut self.workers.start_port)?;
        override_string("RELAY_WORKERS_METRICS_PATH", &mut self.workers.metrics_path);
        override_parse("RELAY_WORKERS_POOL_SIZE", &mut self.workers.pool_size)?;
        override_duration("RELAY_HEALTH_CHECK_INTERVAL", &mut self.health_check.interval)?;
        override_duration("RELAY_HEALTH_CHECK_TIMEOUT", &mut self.health_check.timeout)?;
        override_bool("RELAY_PROBES_ENABLED", &mut self.probes.enabled)?;
        override_parse("RELAY_PROBES_PORT", &mut self.probes.port)?;
        override_bool("RELAY_METRICS_ENABLED", &mut self.metrics.enabled)?;
        override_parse("RELAY_METRICS_PORT", &mut self.metrics.port)?;
        override_string("RELAY_METRICS_PATH", &mut self.metrics.path);
        override_duration("RELAY_METRICS_INTERVAL", &mut self.metrics.interval)?;
        Ok(())
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid("workers.count must be positive".into()));
        }
        if self.workers.start_port == 0 {
            return Err(ConfigError::Invalid(
                "workers.start_port must be non-zero".into(),
            ));
        }
        if self.workers.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "workers.pool_size must be positive".into(),
            ));
        }
        if self.server.proxy_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "server.proxy_timeout must be positive".into(),
            ));
        }
        if self.health_check.interval.is_zero() || self.health_check.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "health_check interval and timeout must be positive".into(),
            ));
        }
        if self.metrics.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics.interval must be positive".into(),
            ));
        }

        // Worker gRPC ports occupy [start_port, start_port + count) and the
        // metrics ports the same range shifted by 100.
        let count = self.workers.count;
        let grpc_end = self
            .workers
            .start_port
            .checked_add(count)
            .ok_or_else(|| ConfigError::Invalid("worker port range overflows".into()))?;
        grpc_end
            .checked_add(100)
            .ok_or_else(|| ConfigError::Invalid("worker metrics port range overflows".into()))?;

        let worker_range = self.workers.start_port..grpc_end;
        let metrics_range = (self.workers.start_port + 100)..(grpc_end + 100);
        for (name, port) in [
            ("server.port", self.server.port),
            ("probes.port", self.probes.port),
            ("metrics.port", self.metrics.port),
        ] {
            if worker_range.contains(&port) || metrics_range.contains(&port) {
                return Err(ConfigError::Invalid(format!(
                    "{name} {port} collides with the worker port range"
                )));
            }
        }
        Ok(())
    }
}

fn override_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}

fn override_parse<T: FromStr>(name: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *target = value.parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn override_bool(name: &str, target: &mut bool) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *target = match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::InvalidEnv {
                    name: name.to_string(),
                    value,
                })
            }
        };
    }
    Ok(())
}

fn override_duration(name: &str, target: &mut Duration) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *target = parse_duration(&value).ok_or_else(|| ConfigError::InvalidEnv {
            name: name.to_string(),
            value,
        })?;
    }
    Ok(())
}

/// Parse a duration string like `5s`, `500ms`, or `1m`. A bare number is
/// taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(rest) = s.strip_suffix("ms") {
        rest.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(rest) = s.strip_suffix('s') {
        rest.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(rest) = s.strip_suffix('m') {
        rest.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Serde adapter for duration fields expressed as `5s`-style strings.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = value.as_millis();
        if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{millis}ms"))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {raw}")))
    }
}
