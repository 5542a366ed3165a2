//! Alert engine: converts measurement and connectivity streams into alert
//! rows and events, with debouncing and automatic resolution.

mod engine;

pub use engine::{spawn_alert_engine, AlertEngineConfig};
