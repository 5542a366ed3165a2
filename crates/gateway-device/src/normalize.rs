//! Telemetry normalization: raw 16-bit registers to physical units.
//!
//! Decoding is capability-gated: a channel the device does not advertise
//! is absent from the output, never zero-filled. Signed fields reading
//! 0x8000 are the slave's invalid-measurement marker and poison the whole
//! sample as a communications error.

use chrono::{DateTime, Utc};
use gateway_common::types::{
    Capabilities, Device, NormalizedSample, Quality, SensorKind, SensorValue,
};
use gateway_modbus::registers::input;

/// Invalid-measurement marker on signed channels (i16::MIN, which no real
/// reading can produce after scaling).
const SIGNED_SENTINEL: u16 = 0x8000;

/// Input register a channel is decoded from.
#[must_use]
pub fn register_for(kind: SensorKind) -> u16 {
    match kind {
        SensorKind::TiltX => input::ANGLE_X,
        SensorKind::TiltY => input::ANGLE_Y,
        SensorKind::Temperature => input::TEMPERATURE,
        SensorKind::AccelX => input::ACCEL_X,
        SensorKind::AccelY => input::ACCEL_Y,
        SensorKind::AccelZ => input::ACCEL_Z,
        SensorKind::GyroX => input::GYRO_X,
        SensorKind::GyroY => input::GYRO_Y,
        SensorKind::GyroZ => input::GYRO_Z,
        SensorKind::WindSpeed => input::WIND_SPEED,
        SensorKind::WindDirection => input::WIND_DIRECTION,
        SensorKind::Load => input::LOAD,
    }
}

/// Number of input registers a telemetry read must cover for the given
/// capability set. Zero means the device has no telemetry channels.
#[must_use]
pub fn required_register_count(caps: Capabilities) -> u16 {
    if caps.has(Capabilities::WIND) {
        input::WIND_DIRECTION + 1
    } else if caps.has(Capabilities::LOAD) {
        input::LOAD + 1
    } else if caps.has(Capabilities::MPU6050) {
        input::QUALITY_FLAGS + 1
    } else {
        0
    }
}

/// Scale one raw register for a channel.
#[must_use]
pub fn scale(kind: SensorKind, raw: u16) -> f64 {
    match kind {
        SensorKind::TiltX | SensorKind::TiltY | SensorKind::Temperature | SensorKind::Load => {
            f64::from(raw as i16) / 100.0
        }
        SensorKind::AccelX
        | SensorKind::AccelY
        | SensorKind::AccelZ
        | SensorKind::GyroX
        | SensorKind::GyroY
        | SensorKind::GyroZ => f64::from(raw as i16) / 1000.0,
        SensorKind::WindSpeed => f64::from(raw) / 100.0,
        SensorKind::WindDirection => f64::from(raw),
    }
}

/// Encode a physical value back to its raw register representation
/// (test support and the simulated slave bank).
#[must_use]
pub fn encode(kind: SensorKind, value: f64) -> u16 {
    match kind {
        SensorKind::TiltX | SensorKind::TiltY | SensorKind::Temperature | SensorKind::Load => {
            (value * 100.0).round() as i16 as u16
        }
        SensorKind::AccelX
        | SensorKind::AccelY
        | SensorKind::AccelZ
        | SensorKind::GyroX
        | SensorKind::GyroY
        | SensorKind::GyroZ => (value * 1000.0).round() as i16 as u16,
        SensorKind::WindSpeed => (value * 100.0).round() as u16,
        SensorKind::WindDirection => value.round() as u16,
    }
}

fn is_signed(kind: SensorKind) -> bool {
    !matches!(kind, SensorKind::WindSpeed | SensorKind::WindDirection)
}

/// Plausibility band per channel; values outside decode but carry WARN.
fn plausible(kind: SensorKind, value: f64) -> bool {
    match kind {
        SensorKind::TiltX | SensorKind::TiltY => value.abs() <= 180.0,
        SensorKind::Temperature => (-55.0..=125.0).contains(&value),
        SensorKind::AccelX | SensorKind::AccelY | SensorKind::AccelZ => value.abs() <= 16.0,
        SensorKind::GyroX | SensorKind::GyroY | SensorKind::GyroZ => value.abs() <= 2000.0,
        SensorKind::WindSpeed => value <= 75.0,
        SensorKind::WindDirection => value <= 359.0,
        SensorKind::Load => true,
    }
}

/// Normalize one raw input-register block for a device.
///
/// The block is read contiguously from register zero; channels the device
/// advertises must be covered or the sample degrades to a communications
/// error with no values.
#[must_use]
pub fn normalize(device: &Device, regs: &[u16], timestamp: DateTime<Utc>) -> NormalizedSample {
    let kinds = SensorKind::for_capabilities(device.capabilities);
    let mut values = Vec::with_capacity(kinds.len());
    let mut overall = Quality::Ok;

    for kind in kinds {
        let addr = register_for(kind) as usize;
        let Some(&raw) = regs.get(addr) else {
            return comms_error(device, timestamp);
        };
        if is_signed(kind) && raw == SIGNED_SENTINEL {
            return comms_error(device, timestamp);
        }

        let value = scale(kind, raw);
        let quality = if plausible(kind, value) {
            Quality::Ok
        } else {
            Quality::Warn
        };
        if quality == Quality::Warn {
            overall = Quality::Warn;
        }

        values.push(SensorValue {
            sensor_id: kind.sensor_id(device.unit_id),
            kind,
            value,
            unit: kind.unit(),
            quality,
        });
    }

    // The slave's own quality flags degrade the sample without discarding
    // the decoded values.
    let sample_counter = match (
        regs.get(input::SAMPLE_LO as usize),
        regs.get(input::SAMPLE_HI as usize),
    ) {
        (Some(&lo), Some(&hi)) if device.capabilities.has(Capabilities::MPU6050) => {
            Some(u32::from(lo) | (u32::from(hi) << 16))
        }
        _ => None,
    };
    if device.capabilities.has(Capabilities::MPU6050) {
        if let Some(&flags) = regs.get(input::QUALITY_FLAGS as usize) {
            if flags != 0 && overall == Quality::Ok {
                overall = Quality::Warn;
            }
        }
    }

    NormalizedSample {
        unit_id: device.unit_id,
        timestamp,
        values,
        quality: overall,
        sample_counter,
    }
}

fn comms_error(device: &Device, timestamp: DateTime<Utc>) -> NormalizedSample {
    NormalizedSample {
        unit_id: device.unit_id,
        timestamp,
        values: Vec::new(),
        quality: Quality::ErrorComms,
        sample_counter: None,
    }
}
