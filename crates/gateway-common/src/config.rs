//! Configuration for the gateway.
//!
//! Supports TOML deserialization with sensible defaults, overlaid by the
//! environment variables the deployment environment sets (environment wins
//! over file values).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Serial port and Modbus timing.
    pub serial: SerialConfig,

    /// Bus discovery parameters.
    pub discovery: DiscoveryConfig,

    /// Telemetry polling parameters.
    pub polling: PollingConfig,

    /// MQTT bridge configuration.
    pub mqtt: MqttConfig,

    /// HTTP/WebSocket server configuration.
    pub http: HttpConfig,

    /// Local database configuration.
    pub storage: StorageConfig,

    /// Log level when RUST_LOG is not set.
    pub log_level: LogConfig,
}

/// Serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path.
    pub port: String,

    /// Baud rate; RTU silence windows derive from this.
    pub baudrate: u32,

    /// Per-transaction timeout for operational traffic.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baudrate: 115_200,
            timeout: Duration::from_millis(300),
        }
    }
}

/// Discovery scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// First unit id scanned.
    pub unit_id_min: u8,

    /// Last unit id scanned (inclusive).
    pub unit_id_max: u8,

    /// Per-probe timeout, shorter than the operational timeout.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Probe retries per candidate before moving on.
    pub probe_retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            unit_id_min: 1,
            unit_id_max: 32,
            probe_timeout: Duration::from_millis(80),
            probe_retries: 1,
        }
    }
}

/// Polling cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Global poll interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Pause between successive devices within one tick.
    #[serde(with = "humantime_serde")]
    pub inter_frame_delay: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            inter_frame_delay: Duration::from_millis(10),
        }
    }
}

/// MQTT bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Enable the bridge. Setting a broker host via the environment
    /// enables it implicitly.
    pub enabled: bool,

    /// Broker hostname.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Optional username.
    pub username: Option<String>,

    /// Optional password.
    pub password: Option<String>,

    /// Publish QoS (0, 1, or 2).
    pub qos: u8,

    /// Topic prefix substituted into every template.
    pub topic_prefix: String,

    /// MQTT client id.
    pub client_id: String,

    /// Keep-alive interval.
    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            qos: 1,
            topic_prefix: "gateway".into(),
            client_id: "rig-gateway".into(),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind host.
    pub host: String,

    /// Bind port.
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// Local database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path.
    pub db_path: PathBuf,

    /// Measurement retention in days.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("gateway.db"),
            retention_days: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogConfig(pub String);

impl Default for LogConfig {
    fn default() -> Self {
        Self("info".into())
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Overlay recognized environment variables onto this configuration.
    /// Environment values win over file values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending variable when a value fails
    /// to parse.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = read_env("MODBUS_PORT") {
            self.serial.port = v;
        }
        if let Some(v) = read_env("MODBUS_BAUDRATE") {
            self.serial.baudrate = parse_env("MODBUS_BAUDRATE", &v)?;
        }
        if let Some(v) = read_env("MODBUS_TIMEOUT") {
            self.serial.timeout = parse_secs("MODBUS_TIMEOUT", &v)?;
        }
        if let Some(v) = read_env("MODBUS_DISCOVERY_TIMEOUT") {
            self.discovery.probe_timeout = parse_secs("MODBUS_DISCOVERY_TIMEOUT", &v)?;
        }
        if let Some(v) = read_env("DEVICE_UNIT_ID_MIN") {
            self.discovery.unit_id_min = parse_env("DEVICE_UNIT_ID_MIN", &v)?;
        }
        if let Some(v) = read_env("DEVICE_UNIT_ID_MAX") {
            self.discovery.unit_id_max = parse_env("DEVICE_UNIT_ID_MAX", &v)?;
        }
        if let Some(v) = read_env("POLL_INTERVAL_SEC") {
            self.polling.interval = parse_secs("POLL_INTERVAL_SEC", &v)?;
        }
        if let Some(v) = read_env("INTER_FRAME_DELAY_MS") {
            let ms: u64 = parse_env("INTER_FRAME_DELAY_MS", &v)?;
            self.polling.inter_frame_delay = Duration::from_millis(ms);
        }
        if let Some(v) = read_env("MQTT_BROKER_HOST") {
            self.mqtt.host = v;
            self.mqtt.enabled = true;
        }
        if let Some(v) = read_env("MQTT_BROKER_PORT") {
            self.mqtt.port = parse_env("MQTT_BROKER_PORT", &v)?;
        }
        if let Some(v) = read_env("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = read_env("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = read_env("MQTT_QOS") {
            let qos: u8 = parse_env("MQTT_QOS", &v)?;
            if qos > 2 {
                return Err(ConfigError::Env {
                    var: "MQTT_QOS".into(),
                    reason: format!("QoS must be 0, 1, or 2, got {qos}"),
                });
            }
            self.mqtt.qos = qos;
        }
        if let Some(v) = read_env("MQTT_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = v;
        }
        if let Some(v) = read_env("HTTP_HOST") {
            self.http.host = v;
        }
        if let Some(v) = read_env("HTTP_PORT") {
            self.http.port = parse_env("HTTP_PORT", &v)?;
        }
        if let Some(v) = read_env("LOG_LEVEL") {
            self.log_level = LogConfig(v);
        }
        if let Some(v) = read_env("DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = read_env("RETENTION_DAYS") {
            self.storage.retention_days = parse_env("RETENTION_DAYS", &v)?;
        }

        self.validate()
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.unit_id_min == 0 || self.discovery.unit_id_max > 247 {
            return Err(ConfigError::Env {
                var: "DEVICE_UNIT_ID_MIN/MAX".into(),
                reason: "unit id range must fall within 1..=247".into(),
            });
        }
        if self.discovery.unit_id_min > self.discovery.unit_id_max {
            return Err(ConfigError::Env {
                var: "DEVICE_UNIT_ID_MIN/MAX".into(),
                reason: "minimum unit id exceeds maximum".into(),
            });
        }
        if self.serial.baudrate == 0 {
            return Err(ConfigError::Env {
                var: "MODBUS_BAUDRATE".into(),
                reason: "baud rate must be non-zero".into(),
            });
        }
        Ok(())
    }
}

fn read_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::Env {
        var: var.into(),
        reason: format!("{e}"),
    })
}

/// Parse a fractional-seconds environment value into a Duration.
fn parse_secs(var: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env(var, value)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::Env {
            var: var.into(),
            reason: format!("expected a non-negative number of seconds, got {value}"),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Environment variable value rejected.
    #[error("invalid value for {var}: {reason}")]
    Env {
        /// Variable name.
        var: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.serial.baudrate, 115_200);
        assert_eq!(config.serial.timeout, Duration::from_millis(300));
        assert_eq!(config.discovery.probe_timeout, Duration::from_millis(80));
        assert_eq!(config.polling.inter_frame_delay, Duration::from_millis(10));
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.mqtt.qos, 1);
        assert!(!config.mqtt.enabled);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [serial]
            port = "/dev/ttyAMA0"
            baudrate = 19200
            timeout = "500ms"

            [discovery]
            unit_id_min = 1
            unit_id_max = 20
            probe_timeout = "80ms"

            [polling]
            interval = "1s"

            [mqtt]
            enabled = true
            host = "broker.example"
            topic_prefix = "site7"
        "#;

        let config = GatewayConfig::from_toml(toml).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyAMA0");
        assert_eq!(config.serial.baudrate, 19_200);
        assert_eq!(config.serial.timeout, Duration::from_millis(500));
        assert_eq!(config.discovery.unit_id_max, 20);
        assert_eq!(config.polling.interval, Duration::from_secs(1));
        assert!(config.mqtt.enabled);
        assert_eq!(config.mqtt.topic_prefix, "site7");
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = GatewayConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = GatewayConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.serial.baudrate, config.serial.baudrate);
        assert_eq!(parsed.polling.interval, config.polling.interval);
    }

    #[test]
    fn test_validate_rejects_bad_range() {
        let mut config = GatewayConfig::default();
        config.discovery.unit_id_min = 40;
        config.discovery.unit_id_max = 10;
        assert!(config.validate().is_err());

        config.discovery.unit_id_min = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_secs_fractional() {
        let d = parse_secs("X", "0.3").unwrap();
        assert_eq!(d, Duration::from_millis(300));
        let d = parse_secs("X", "0.08").unwrap();
        assert_eq!(d, Duration::from_millis(80));
        assert!(parse_secs("X", "-1").is_err());
        assert!(parse_secs("X", "nope").is_err());
    }
}
