//! Gateway configuration with validation.

use serde::{Deserialize, Serialize};
use shared_bus::ConnectionParams;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP front end
    pub http: HttpConfig,
    /// Message bus connection
    pub bus: BusConfig,
    /// Timeout configuration
    pub timeouts: TimeoutConfig,
    /// Request limits
    pub limits: LimitsConfig,
    /// Log level used when `RUST_LOG` is unset
    pub log_level: LogLevel,
}

impl GatewayConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_request_size == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_request_size cannot be 0".into(),
            ));
        }

        if self.timeouts.rpc.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "rpc timeout cannot be 0".into(),
            ));
        }

        if self.bus.hostname.trim().is_empty() {
            return Err(ConfigError::InvalidBus("hostname cannot be empty".into()));
        }

        if self.bus.port == 0 {
            return Err(ConfigError::InvalidBus("port cannot be 0".into()));
        }

        if self.bus.heartbeat.as_secs() > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidBus(format!(
                "heartbeat cannot exceed {}s",
                u16::MAX
            )));
        }

        Ok(())
    }

    /// Get HTTP server bind address
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http.host, self.http.port)
    }

    /// Bus connection parameters
    pub fn connection_params(&self) -> ConnectionParams {
        self.bus.connection_params()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address
    pub host: IpAddr,
    /// Port (default: 8080)
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
        }
    }
}

/// Message bus connection configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub hostname: String,
    pub port: u16,
    /// Also stamped on every request as `user_id`
    pub login: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval (whole seconds; 0 disables)
    #[serde(with = "humantime_serde")]
    pub heartbeat: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        let params = ConnectionParams::default();
        Self {
            hostname: params.hostname,
            port: params.port,
            login: params.login,
            password: params.password,
            vhost: params.vhost,
            heartbeat: Duration::from_secs(u64::from(params.heartbeat)),
        }
    }
}

impl BusConfig {
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            hostname: self.hostname.clone(),
            port: self.port,
            login: self.login.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
            heartbeat: u16::try_from(self.heartbeat.as_secs()).unwrap_or(u16::MAX),
        }
    }
}

impl std::fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default timeout for calls that do not give one
    #[serde(with = "humantime_serde")]
    pub rpc: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rpc: crate::domain::types::DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Request limits configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Max request body size in bytes (default: 1MB)
    pub max_request_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size: 1024 * 1024, // 1MB
        }
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ConfigError::Invalid(format!("unknown log level '{}'", other))),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid size limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid bus connection settings
    #[error("invalid bus settings: {0}")]
    InvalidBus(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub use humantime_serde::parse_duration;

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse `"500ms"`, `"20s"`, `"1m"` or plain seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        // "ms" before "s", which it also ends with.
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .ok()
                .and_then(|m| m.checked_mul(60))
                .map(Duration::from_secs)
                .ok_or("invalid minutes")
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
