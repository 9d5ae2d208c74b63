//! Collector configuration
//!
//! Settings come from an optional JSON file and are then overridden by
//! `CFGVAULT_*` environment variables. Durations are written as (fractional)
//! seconds in the file and in the environment.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cfgvault_retry::{RetryPolicy, MAX_ALLOWED_RETRIES};

use crate::error::ConfigError;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CFGVAULT_";

/// Who consumes a relay upload once it lands in the ingestion root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayConsumer {
    /// The relay adapter polls its inbox and stores the capture itself
    #[default]
    AdapterPoll,
    /// The ingestion coordinator stores uploads and notifies waiting adapters
    Coordinator,
}

impl FromStr for RelayConsumer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adapter-poll" | "adapter_poll" | "poll" => Ok(Self::AdapterPoll),
            "coordinator" => Ok(Self::Coordinator),
            other => Err(ConfigError::InvalidValue {
                key: "relay consumer".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Settings for devices that push their configuration over FTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ingestion_root: PathBuf,

    /// Address the device should upload to; detected per device when unset
    pub server_address: Option<String>,

    pub ftp_port: u16,
    pub ftp_user: String,
    pub ftp_password: String,

    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    #[serde(with = "duration_secs")]
    pub poll_budget: Duration,

    /// Wait after first sighting so a still-growing file can finish
    #[serde(with = "duration_secs")]
    pub settle_interval: Duration,

    /// How long the trigger command output is drained before disconnecting
    #[serde(with = "duration_secs")]
    pub trigger_grace: Duration,

    pub consumer: RelayConsumer,

    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub passive_ports: (u16, u16),
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ingestion_root: PathBuf::from("/var/lib/cfgvault/ftp-ingestion"),
            server_address: None,
            ftp_port: 21,
            ftp_user: "cfgvault".to_string(),
            ftp_password: String::new(),
            poll_interval: Duration::from_secs(3),
            poll_budget: Duration::from_secs(120),
            settle_interval: Duration::from_secs(1),
            trigger_grace: Duration::from_secs(30),
            consumer: RelayConsumer::AdapterPoll,
            max_connections: 10,
            max_connections_per_ip: 3,
            passive_ports: (60000, 60100),
        }
    }
}

impl RelayConfig {
    /// Inbox directory a relay device uploads into: `{root}/{vendor}/{device}`
    pub fn inbox(&self, vendor_tag: &str, device_id: &str) -> PathBuf {
        self.ingestion_root.join(vendor_tag).join(device_id)
    }

    /// Address to hand to the device: the configured one, else the local
    /// address of the route towards `device_address`.
    pub fn resolve_server_address(&self, device_address: &str) -> Option<String> {
        match self.server_address.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => Some(addr.to_string()),
            _ => detect_route_address(device_address).map(|ip| ip.to_string()),
        }
    }
}

/// Local address the kernel would use to reach `target`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn detect_route_address(target: &str) -> Option<IpAddr> {
    let target = target.trim().trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = target.parse().ok()?;
    let bind = if ip.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect((ip, 9)).ok()?;
    let local = socket.local_addr().ok()?.ip();
    (!local.is_unspecified()).then_some(local)
}

/// Top-level collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub storage_root: PathBuf,

    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Retries after the first attempt: 0 or 1
    pub max_retries: u32,

    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,

    /// Concurrent device collections
    pub workers: usize,

    pub relay: RelayConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            max_retries: 1,
            retry_delay: Duration::ZERO,
            workers: 1,
            relay: RelayConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// JSON file plus environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("STORAGE_PATH") {
            self.storage_root = PathBuf::from(v);
        }
        if let Some(v) = get("CONNECT_TIMEOUT") {
            self.connect_timeout = parse_secs("CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("COMMAND_TIMEOUT") {
            self.command_timeout = parse_secs("COMMAND_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.max_retries = parse_value("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_DELAY") {
            self.retry_delay = parse_secs("RETRY_DELAY", &v)?;
        }
        if let Some(v) = get("WORKERS") {
            self.workers = parse_value("WORKERS", &v)?;
        }
        if let Some(v) = get("FTP_ROOT") {
            self.relay.ingestion_root = PathBuf::from(v);
        }
        if let Some(v) = get("SERVER_IP") {
            self.relay.server_address = Some(v);
        }
        if let Some(v) = get("FTP_PORT") {
            self.relay.ftp_port = parse_value("FTP_PORT", &v)?;
        }
        if let Some(v) = get("FTP_USER") {
            self.relay.ftp_user = v;
        }
        if let Some(v) = lookup(&format!("{ENV_PREFIX}FTP_PASSWORD")) {
            self.relay.ftp_password = v;
        }
        if let Some(v) = get("RELAY_CONSUMER") {
            self.relay.consumer = v.parse()?;
        }
        if let Some(v) = get("RELAY_POLL_BUDGET") {
            self.relay.poll_budget = parse_secs("RELAY_POLL_BUDGET", &v)?;
        }
        if let Some(v) = get("RELAY_POLL_INTERVAL") {
            self.relay.poll_interval = parse_secs("RELAY_POLL_INTERVAL", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::validation("workers must be at least 1"));
        }
        if self.max_retries > MAX_ALLOWED_RETRIES {
            return Err(ConfigError::validation(format!(
                "max_retries {} exceeds the ceiling of {}",
                self.max_retries, MAX_ALLOWED_RETRIES
            )));
        }
        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(ConfigError::validation("timeouts must be greater than zero"));
        }

        let relay = &self.relay;
        if relay.poll_interval.is_zero() {
            return Err(ConfigError::validation("relay poll_interval must be greater than zero"));
        }
        if relay.poll_budget < relay.poll_interval {
            return Err(ConfigError::validation(
                "relay poll_budget must be at least one poll_interval",
            ));
        }
        if relay.ftp_user.trim().is_empty() {
            return Err(ConfigError::validation("relay ftp_user cannot be empty"));
        }
        if relay.max_connections == 0 || relay.max_connections_per_ip == 0 {
            return Err(ConfigError::validation("FTP connection limits must be at least 1"));
        }
        if relay.passive_ports.0 == 0 || relay.passive_ports.0 > relay.passive_ports.1 {
            return Err(ConfigError::validation("FTP passive port range is invalid"));
        }
        Ok(())
    }

    /// Retry policy derived from `max_retries` and `retry_delay`
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(self.max_retries, self.retry_delay)
            .map_err(|e| ConfigError::validation(e.to_string()))
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_value(key, value)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

/// Serialize a `Duration` as fractional seconds.
mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
