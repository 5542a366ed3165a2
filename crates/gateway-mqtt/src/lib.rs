//! MQTT bridge: publishes telemetry, alerts, connectivity transitions,
//! and the device inventory to an external broker.

mod bridge;
mod topics;

pub use bridge::spawn_bridge;
pub use topics::TopicTemplates;
