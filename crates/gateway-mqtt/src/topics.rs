//! Topic templates and JSON payload builders.
//!
//! Topic ids use the canonical `UNIT_<n>` device id so topics stay stable
//! across alias changes; human-facing payload fields carry the display
//! name.

use chrono::{DateTime, Utc};
use gateway_common::types::{Alert, Device, Sensor, SensorValue};
use serde_json::{json, Value};

/// Topic builder bound to the configured prefix.
#[derive(Debug, Clone)]
pub struct TopicTemplates {
    prefix: String,
}

impl TopicTemplates {
    /// Create templates for a prefix; trailing slashes are dropped.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Canonical topic id for a device.
    #[must_use]
    pub fn device_id(unit_id: u8) -> String {
        format!("UNIT_{unit_id}")
    }

    /// `{prefix}/{deviceId}/{sensorType}/measurements`
    #[must_use]
    pub fn telemetry(&self, device_id: &str, sensor_type: &str) -> String {
        format!("{}/{}/{}/measurements", self.prefix, device_id, sensor_type)
    }

    /// `{prefix}/{deviceId}/alerts`
    #[must_use]
    pub fn alerts(&self, device_id: &str) -> String {
        format!("{}/{}/alerts", self.prefix, device_id)
    }

    /// `{prefix}/gateway/connect`
    #[must_use]
    pub fn gateway_connect(&self) -> String {
        format!("{}/gateway/connect", self.prefix)
    }

    /// `{prefix}/gateway/disconnect`
    #[must_use]
    pub fn gateway_disconnect(&self) -> String {
        format!("{}/gateway/disconnect", self.prefix)
    }

    /// `{prefix}/gateway/attributes`
    #[must_use]
    pub fn gateway_attributes(&self) -> String {
        format!("{}/gateway/attributes", self.prefix)
    }
}

/// Telemetry payload for one sensor value.
#[must_use]
pub fn telemetry_payload(
    timestamp: DateTime<Utc>,
    device_id: &str,
    value: &SensorValue,
) -> Value {
    json!({
        "timestamp": timestamp.timestamp_millis(),
        "device_id": device_id,
        "sensor_id": value.sensor_id,
        "sensor_type": value.kind.as_str(),
        "value": value.value,
        "unit": value.unit,
        "quality": value.quality.to_string(),
    })
}

/// Alert payload, including the acknowledgement state.
#[must_use]
pub fn alert_payload(alert: &Alert) -> Value {
    json!({
        "id": alert.id,
        "timestamp": alert.timestamp.timestamp_millis(),
        "level": alert.level.as_str(),
        "code": alert.code.as_str(),
        "message": alert.message,
        "sensor_id": alert.sensor_id,
        "ack": alert.ack,
        "ack_reason": alert.ack_reason,
    })
}

/// Connectivity payload (`connect`/`disconnect` topics).
#[must_use]
pub fn connectivity_payload(device_name: &str) -> Value {
    json!({ "device": device_name })
}

/// Gateway-keyed inventory: one entry per device with its sensors.
#[must_use]
pub fn attributes_payload(devices: &[(Device, Vec<Sensor>)]) -> Value {
    let mut map = serde_json::Map::new();
    for (device, sensors) in devices {
        map.insert(
            device.display_name(),
            json!({
                "unit_id": device.unit_id,
                "vendor_code": device.vendor_code,
                "product_code": device.product_code,
                "fw_version": Device::version_string(device.fw_version),
                "capabilities": device.capabilities.names(),
                "sensors": sensors.iter().map(|s| s.sensor_id.clone()).collect::<Vec<_>>(),
            }),
        );
    }
    Value::Object(map)
}
