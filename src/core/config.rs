//! Configuration management for the host portal
//!
//! Policy knobs for endpoint pools plus logging settings. Defaults match the
//! stock remote-storage client tuning.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection pool policy
    pub portal: PortalConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection pool policy, consumed when a portal context is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Connections an endpoint pool spins up as soon as it has work
    pub min_host_connections: usize,

    /// Upper bound on connections per endpoint
    pub max_host_connections: usize,

    /// Upper bound on connections across all endpoints
    pub max_connections: usize,

    /// In-flight workload per connection before another one is warranted
    pub max_workload: i64,

    /// Idle time after which a connection closes itself
    #[serde(with = "duration_str")]
    pub min_idle: Duration,

    /// Backoff between growth steps once a pool is at its stable target
    #[serde(with = "duration_str")]
    pub wait_stable_time: Duration,

    /// Consecutive failed connects before queued work is abandoned
    pub abort_conn_attempts: u32,

    /// Interval between receiver-driven health checks
    #[serde(with = "duration_str")]
    pub check_interval: Duration,

    /// Default retry budget for new operations
    pub max_retry: u32,

    /// Minimum interval between opportunistic garbage collection passes
    #[serde(with = "duration_str")]
    pub compact_interval: Duration,

    /// Transport connect timeout
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, compact)
    pub format: String,

    /// Include thread names in log lines
    pub thread_names: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            min_host_connections: 1,
            max_host_connections: 4,
            max_connections: 128,
            max_workload: 10 * 1024 * 1024, // 10MiB
            min_idle: Duration::from_secs(30),
            wait_stable_time: Duration::from_secs(15),
            abort_conn_attempts: 4,
            check_interval: Duration::from_secs(2),
            max_retry: 2,
            compact_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            thread_names: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config file
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(file_config) = Self::from_file("host-portal.toml") {
            config = file_config;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        let portal = &mut self.portal;

        if let Ok(v) = env::var("HP_MIN_HOST_CONNECTIONS") {
            portal.min_host_connections = v
                .parse()
                .map_err(|e| Error::config(format!("Invalid min host connections: {}", e)))?;
        }

        if let Ok(v) = env::var("HP_MAX_HOST_CONNECTIONS") {
            portal.max_host_connections = v
                .parse()
                .map_err(|e| Error::config(format!("Invalid max host connections: {}", e)))?;
        }

        if let Ok(v) = env::var("HP_MAX_CONNECTIONS") {
            portal.max_connections = v
                .parse()
                .map_err(|e| Error::config(format!("Invalid max connections: {}", e)))?;
        }

        if let Ok(v) = env::var("HP_MAX_WORKLOAD") {
            portal.max_workload = v
                .parse()
                .map_err(|e| Error::config(format!("Invalid max workload: {}", e)))?;
        }

        if let Ok(v) = env::var("HP_MAX_RETRY") {
            portal.max_retry = v
                .parse()
                .map_err(|e| Error::config(format!("Invalid max retry: {}", e)))?;
        }

        if let Ok(v) = env::var("HP_ABORT_ATTEMPTS") {
            portal.abort_conn_attempts = v
                .parse()
                .map_err(|e| Error::config(format!("Invalid abort attempts: {}", e)))?;
        }

        if let Ok(v) = env::var("HP_MIN_IDLE") {
            portal.min_idle = parse_duration(&v)
                .map_err(|e| Error::config(format!("Invalid min idle: {}", e)))?;
        }

        if let Ok(v) = env::var("HP_WAIT_STABLE_TIME") {
            portal.wait_stable_time = parse_duration(&v)
                .map_err(|e| Error::config(format!("Invalid wait stable time: {}", e)))?;
        }

        if let Ok(level) = env::var("HP_LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.portal.validate()?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }
}

impl PortalConfig {
    /// Validate pool policy values
    pub fn validate(&self) -> Result<()> {
        if self.min_host_connections == 0 {
            return Err(Error::config("min_host_connections must be at least 1"));
        }
        if self.max_host_connections < self.min_host_connections {
            return Err(Error::config(
                "max_host_connections must not be below min_host_connections",
            ));
        }
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be at least 1"));
        }
        if self.max_workload < 1 {
            return Err(Error::config("max_workload must be at least 1"));
        }
        if self.abort_conn_attempts == 0 {
            return Err(Error::config("abort_conn_attempts must be at least 1"));
        }
        if self.check_interval.is_zero() {
            return Err(Error::config("check_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Durations as human strings: `"250ms"`, `"30s"`, `"5m"`, `"1h"` or bare seconds
mod duration_str {
    use super::parse_duration;
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = value.as_millis();
        if ms % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", ms / 1000))
        } else {
            serializer.serialize_str(&format!("{}ms", ms))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string like '30s' or '5m'")
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration(value).map_err(E::custom)
            }

            fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("negative duration"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

// Simple duration parser for common formats
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        // Try parsing as raw seconds
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}
