//! Domain model for the gateway: devices, sensors, measurements, alerts.
//!
//! Devices are keyed by their Modbus unit id while they exist on the bus.
//! A device's capability bitmask determines the fixed set of logical
//! sensors it exposes; sensor ids are stable strings derived from the unit
//! id and channel name (`UNIT_2_TILT_X`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability bitmask reported by a slave in its identity block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub u16);

impl Capabilities {
    /// RS-485 transceiver present (always set on bus devices).
    pub const RS485: u16 = 0x0001;
    /// MPU6050 inertial unit: tilt, temperature, accel, gyro channels.
    pub const MPU6050: u16 = 0x0002;
    /// Identify LED supported.
    pub const IDENTIFY: u16 = 0x0004;
    /// Wind speed/direction channel.
    pub const WIND: u16 = 0x0008;
    /// Load cell channel.
    pub const LOAD: u16 = 0x0010;

    /// Check a single capability bit.
    #[must_use]
    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    /// Human-readable capability names, in bit order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.has(Self::RS485) {
            out.push("RS485");
        }
        if self.has(Self::MPU6050) {
            out.push("MPU6050");
        }
        if self.has(Self::IDENTIFY) {
            out.push("IDENTIFY");
        }
        if self.has(Self::WIND) {
            out.push("WIND");
        }
        if self.has(Self::LOAD) {
            out.push("LOAD");
        }
        out
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join("|"))
    }
}

/// Connectivity status of a device as tracked by the polling path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Responding to polls.
    Online,
    /// Three or more consecutive failed transactions.
    Offline,
    /// Never successfully polled since creation.
    #[default]
    Unknown,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One Modbus RTU slave known to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Modbus unit id (1..=247), primary identity on the bus.
    pub unit_id: u8,
    /// Operator-assigned name, up to 64 printable ASCII bytes.
    pub alias: String,
    /// Vendor id word from the identity block.
    pub vendor_code: u16,
    /// Product id word from the identity block.
    pub product_code: u16,
    /// Vendor name from the extended ASCII block, when present.
    #[serde(default)]
    pub vendor_name: String,
    /// Product name from the extended ASCII block, when present.
    #[serde(default)]
    pub product_name: String,
    /// Hardware version word, `(major << 8) | minor`.
    pub hw_version: u16,
    /// Firmware version word, `(major << 8) | minor`.
    pub fw_version: u16,
    /// Capability bitmask.
    pub capabilities: Capabilities,
    /// Status bitmask reported by the slave.
    #[serde(default)]
    pub status_flags: u16,
    /// Error bitmask reported by the slave.
    #[serde(default)]
    pub error_flags: u16,
    /// Uptime seconds reported by the slave at discovery time.
    #[serde(default)]
    pub uptime_secs: u32,
    /// Connectivity status.
    #[serde(default)]
    pub status: DeviceStatus,
    /// Timestamp of the last successful telemetry read.
    pub last_seen: Option<DateTime<Utc>>,
    /// Consecutive failed transactions; reset on any success.
    #[serde(default)]
    pub consecutive_errors: u32,
    /// Per-device poll interval override in seconds (advisory; the global
    /// interval remains authoritative for scheduling).
    pub poll_interval_override: Option<u32>,
}

impl Device {
    /// Create a bare device record for a freshly discovered unit id.
    #[must_use]
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            alias: String::new(),
            vendor_code: 0,
            product_code: 0,
            vendor_name: String::new(),
            product_name: String::new(),
            hw_version: 0,
            fw_version: 0,
            capabilities: Capabilities::default(),
            status_flags: 0,
            error_flags: 0,
            uptime_secs: 0,
            status: DeviceStatus::Unknown,
            last_seen: None,
            consecutive_errors: 0,
            poll_interval_override: None,
        }
    }

    /// Display name: the alias when set, otherwise `UNIT_<id>`.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.alias.is_empty() {
            format!("UNIT_{}", self.unit_id)
        } else {
            self.alias.clone()
        }
    }

    /// Render a version word as `major.minor`.
    #[must_use]
    pub fn version_string(word: u16) -> String {
        format!("{}.{}", word >> 8, word & 0xFF)
    }
}

/// Logical sensor channels a device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorKind {
    /// Tilt around X, degrees.
    TiltX,
    /// Tilt around Y, degrees.
    TiltY,
    /// Die temperature, °C.
    Temperature,
    /// Acceleration X, g.
    AccelX,
    /// Acceleration Y, g.
    AccelY,
    /// Acceleration Z, g.
    AccelZ,
    /// Angular rate X, deg/s.
    GyroX,
    /// Angular rate Y, deg/s.
    GyroY,
    /// Angular rate Z, deg/s.
    GyroZ,
    /// Wind speed, m/s.
    WindSpeed,
    /// Wind direction, degrees 0..=359.
    WindDirection,
    /// Load, kg.
    Load,
}

impl SensorKind {
    /// All kinds, in stable declaration order.
    pub const ALL: [SensorKind; 12] = [
        Self::TiltX,
        Self::TiltY,
        Self::Temperature,
        Self::AccelX,
        Self::AccelY,
        Self::AccelZ,
        Self::GyroX,
        Self::GyroY,
        Self::GyroZ,
        Self::WindSpeed,
        Self::WindDirection,
        Self::Load,
    ];

    /// Stable channel name used in sensor ids and topic segments.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TiltX => "TILT_X",
            Self::TiltY => "TILT_Y",
            Self::Temperature => "TEMPERATURE",
            Self::AccelX => "ACCEL_X",
            Self::AccelY => "ACCEL_Y",
            Self::AccelZ => "ACCEL_Z",
            Self::GyroX => "GYRO_X",
            Self::GyroY => "GYRO_Y",
            Self::GyroZ => "GYRO_Z",
            Self::WindSpeed => "WIND_SPEED",
            Self::WindDirection => "WIND_DIRECTION",
            Self::Load => "LOAD",
        }
    }

    /// Parse the stable channel name back into a kind.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Physical unit of the decoded value.
    #[must_use]
    pub fn unit(self) -> &'static str {
        match self {
            Self::TiltX | Self::TiltY | Self::WindDirection => "deg",
            Self::Temperature => "degC",
            Self::AccelX | Self::AccelY | Self::AccelZ => "g",
            Self::GyroX | Self::GyroY | Self::GyroZ => "dps",
            Self::WindSpeed => "m/s",
            Self::Load => "kg",
        }
    }

    /// Default alarm thresholds `(lo, hi)` applied when a sensor is first
    /// provisioned. `None` means no threshold of that polarity.
    #[must_use]
    pub fn default_thresholds(self) -> (Option<f64>, Option<f64>) {
        match self {
            Self::TiltX | Self::TiltY => (Some(-5.0), Some(5.0)),
            Self::Temperature => (Some(-20.0), Some(70.0)),
            Self::WindSpeed => (None, Some(30.0)),
            Self::Load => (None, Some(5000.0)),
            _ => (None, None),
        }
    }

    /// The sensor set implied by a capability bitmask.
    #[must_use]
    pub fn for_capabilities(caps: Capabilities) -> Vec<SensorKind> {
        let mut out = Vec::new();
        if caps.has(Capabilities::MPU6050) {
            out.extend([
                Self::TiltX,
                Self::TiltY,
                Self::Temperature,
                Self::AccelX,
                Self::AccelY,
                Self::AccelZ,
                Self::GyroX,
                Self::GyroY,
                Self::GyroZ,
            ]);
        }
        if caps.has(Capabilities::WIND) {
            out.extend([Self::WindSpeed, Self::WindDirection]);
        }
        if caps.has(Capabilities::LOAD) {
            out.push(Self::Load);
        }
        out
    }

    /// Stable sensor id for a channel of a given device.
    #[must_use]
    pub fn sensor_id(self, unit_id: u8) -> String {
        format!("UNIT_{}_{}", unit_id, self.as_str())
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical channel of a device, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    /// Unique sensor id, `UNIT_<id>_<CHANNEL>`.
    pub sensor_id: String,
    /// Owning device unit id.
    pub unit_id: u8,
    /// Channel kind.
    pub kind: SensorKind,
    /// Physical unit (redundant with kind, kept for self-description).
    pub unit: String,
    /// Input register address the value is decoded from.
    pub register: u16,
    /// Low alarm threshold, if any.
    pub alarm_lo: Option<f64>,
    /// High alarm threshold, if any.
    pub alarm_hi: Option<f64>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Validity band attached to every measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    /// Value decoded cleanly and is physically plausible.
    #[default]
    Ok,
    /// Value decoded but falls outside the plausible range.
    Warn,
    /// Value violates a configured alarm threshold.
    Alarm,
    /// Decode failed; the value is not meaningful.
    ErrorComms,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warn => write!(f, "WARN"),
            Self::Alarm => write!(f, "ALARM"),
            Self::ErrorComms => write!(f, "ERROR_COMMS"),
        }
    }
}

impl Quality {
    /// Parse the persisted representation.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Self::Ok),
            "WARN" => Some(Self::Warn),
            "ALARM" => Some(Self::Alarm),
            "ERROR_COMMS" => Some(Self::ErrorComms),
            _ => None,
        }
    }
}

/// One decoded channel value within a normalized sample.
#[derive(Debug, Clone, Serialize)]
pub struct SensorValue {
    /// Stable sensor id.
    pub sensor_id: String,
    /// Channel kind.
    pub kind: SensorKind,
    /// Scaled physical value.
    pub value: f64,
    /// Physical unit.
    pub unit: &'static str,
    /// Per-value quality.
    pub quality: Quality,
}

/// One normalized poll result for one device.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedSample {
    /// Device unit id.
    pub unit_id: u8,
    /// Read timestamp, UTC millisecond precision.
    pub timestamp: DateTime<Utc>,
    /// Decoded channel values; absent channels were not advertised.
    pub values: Vec<SensorValue>,
    /// Overall sample quality (worst of the per-value qualities).
    pub quality: Quality,
    /// Free-running sample counter from the slave, when decoded.
    pub sample_counter: Option<u32>,
}

/// One persisted measurement row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    /// Row id.
    pub id: i64,
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Sensor the value belongs to.
    pub sensor_id: String,
    /// Channel kind.
    pub kind: SensorKind,
    /// Scaled physical value.
    pub value: f64,
    /// Physical unit.
    pub unit: String,
    /// Quality band.
    pub quality: Quality,
    /// Whether the row has been published to the cloud.
    pub sent_to_cloud: bool,
}

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    /// Informational.
    Info,
    /// Degraded but operational.
    Warn,
    /// Threshold violation.
    Alarm,
    /// Requires immediate attention.
    Critical,
}

impl AlertLevel {
    /// Stable persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Alarm => "ALARM",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parse the persisted representation.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ALARM" => Some(Self::Alarm),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Closed set of alert causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCode {
    /// Measurement above the sensor's high threshold.
    ThresholdExceededHi,
    /// Measurement below the sensor's low threshold.
    ThresholdExceededLo,
    /// Device missed its offline deadline.
    DeviceOffline,
}

impl AlertCode {
    /// Stable persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThresholdExceededHi => "THRESHOLD_EXCEEDED_HI",
            Self::ThresholdExceededLo => "THRESHOLD_EXCEEDED_LO",
            Self::DeviceOffline => "DEVICE_OFFLINE",
        }
    }

    /// Parse the persisted representation.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "THRESHOLD_EXCEEDED_HI" => Some(Self::ThresholdExceededHi),
            "THRESHOLD_EXCEEDED_LO" => Some(Self::ThresholdExceededLo),
            "DEVICE_OFFLINE" => Some(Self::DeviceOffline),
            _ => None,
        }
    }
}

impl fmt::Display for AlertCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected anomaly, persisted and pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Row id.
    pub id: i64,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Triggering sensor, when sensor-scoped.
    pub sensor_id: Option<String>,
    /// Triggering device name, when device-scoped.
    pub rig_id: Option<String>,
    /// Severity.
    pub level: AlertLevel,
    /// Cause.
    pub code: AlertCode,
    /// Human-readable message.
    pub message: String,
    /// Acknowledged flag; monotonic once set.
    pub ack: bool,
    /// Acknowledgement time.
    pub ack_at: Option<DateTime<Utc>>,
    /// Acknowledgement reason; auto-resolutions use an `auto:` prefix.
    pub ack_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_names() {
        let caps = Capabilities(Capabilities::RS485 | Capabilities::MPU6050 | Capabilities::LOAD);
        assert_eq!(caps.names(), vec!["RS485", "MPU6050", "LOAD"]);
        assert!(caps.has(Capabilities::LOAD));
        assert!(!caps.has(Capabilities::WIND));
    }

    #[test]
    fn test_sensor_set_for_capabilities() {
        let caps = Capabilities(Capabilities::MPU6050 | Capabilities::WIND);
        let kinds = SensorKind::for_capabilities(caps);
        assert_eq!(kinds.len(), 11);
        assert!(kinds.contains(&SensorKind::TiltX));
        assert!(kinds.contains(&SensorKind::WindDirection));
        assert!(!kinds.contains(&SensorKind::Load));
    }

    #[test]
    fn test_sensor_id_format() {
        assert_eq!(SensorKind::TiltX.sensor_id(2), "UNIT_2_TILT_X");
        assert_eq!(SensorKind::WindSpeed.sensor_id(16), "UNIT_16_WIND_SPEED");
    }

    #[test]
    fn test_sensor_kind_roundtrip() {
        for kind in SensorKind::ALL {
            assert_eq!(SensorKind::from_str_opt(kind.as_str()), Some(kind));
        }
        assert_eq!(SensorKind::from_str_opt("BOGUS"), None);
    }

    #[test]
    fn test_display_name_falls_back_to_unit() {
        let mut dev = Device::new(7);
        assert_eq!(dev.display_name(), "UNIT_7");
        dev.alias = "Crane-North".into();
        assert_eq!(dev.display_name(), "Crane-North");
    }

    #[test]
    fn test_version_string() {
        assert_eq!(Device::version_string(0x0102), "1.2");
        assert_eq!(Device::version_string(0x0A00), "10.0");
    }

    #[test]
    fn test_quality_roundtrip() {
        for q in [Quality::Ok, Quality::Warn, Quality::Alarm, Quality::ErrorComms] {
            assert_eq!(Quality::from_str_opt(&q.to_string()), Some(q));
        }
    }

    #[test]
    fn test_alert_code_roundtrip() {
        for code in [
            AlertCode::ThresholdExceededHi,
            AlertCode::ThresholdExceededLo,
            AlertCode::DeviceOffline,
        ] {
            assert_eq!(AlertCode::from_str_opt(code.as_str()), Some(code));
        }
    }
}
