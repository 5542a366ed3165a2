//! Common types and utilities shared by every gateway crate.
//!
//! This crate provides:
//! - The device/sensor/measurement/alert data model
//! - [`GatewayError`] and [`GatewayResult`] for cross-crate error handling
//! - [`GatewayEvent`] and the bounded broadcast [`EventBus`]
//! - [`GatewayConfig`] with TOML loading and environment overrides

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use events::{EventBus, GatewayEvent};
pub use types::{
    Alert, AlertCode, AlertLevel, Capabilities, Device, DeviceStatus, Measurement,
    NormalizedSample, Quality, Sensor, SensorKind, SensorValue,
};
