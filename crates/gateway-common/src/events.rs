//! In-process event fan-out.
//!
//! One publisher (the polling/alert path), many bounded subscribers (the
//! WebSocket hub and the MQTT bridge). Subscribers that fall behind lose
//! the oldest events rather than blocking the publisher; protecting bus
//! timing takes priority over lossless delivery.

use crate::types::{Alert, DeviceStatus, SensorValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default per-subscriber queue depth.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events published to WebSocket clients and the MQTT bridge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A device produced a normalized telemetry sample.
    TelemetryUpdate {
        /// Device unit id.
        unit_id: u8,
        /// Sample timestamp.
        timestamp: DateTime<Utc>,
        /// Decoded channel values.
        values: Vec<SensorValue>,
        /// Device connectivity status at publish time.
        status: DeviceStatus,
        /// Persisted measurement row ids backing this sample; consumed by
        /// the MQTT bridge for sent-flag bookkeeping, not serialized.
        #[serde(skip)]
        measurement_ids: Vec<i64>,
    },
    /// A device transitioned to online.
    DeviceOnline {
        /// Device unit id.
        unit_id: u8,
        /// Display name at transition time.
        device: String,
    },
    /// A device transitioned to offline.
    DeviceOffline {
        /// Device unit id.
        unit_id: u8,
        /// Display name at transition time.
        device: String,
    },
    /// A new alert was created.
    NewAlert {
        /// The alert row as persisted.
        alert: Alert,
    },
    /// An alert was acknowledged, by the operator or by auto-resolution.
    AlertAcknowledged {
        /// Alert row id.
        id: i64,
        /// True when the alert engine resolved it automatically.
        auto: bool,
        /// Acknowledgement reason.
        reason: String,
    },
}

/// Bounded broadcast bus for [`GatewayEvent`]s.
///
/// Wraps a tokio broadcast channel: every subscriber gets an independent
/// cursor over a shared ring of `capacity` events, and a lagging subscriber
/// observes `RecvError::Lagged` instead of stalling the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber queue depth.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Delivery is best-effort: having no subscribers is
    /// not an error.
    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(GatewayEvent::DeviceOnline {
            unit_id: 2,
            device: "UNIT_2".into(),
        });

        match rx.recv().await.unwrap() {
            GatewayEvent::DeviceOnline { unit_id, .. } => assert_eq!(unit_id, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(GatewayEvent::DeviceOffline {
            unit_id: 9,
            device: "UNIT_9".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10u8 {
            bus.publish(GatewayEvent::DeviceOnline {
                unit_id: i,
                device: format!("UNIT_{i}"),
            });
        }

        // The first recv reports the lag, subsequent recvs resume from the
        // oldest retained event.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 6),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_event_serialization_tags() {
        let ev = GatewayEvent::AlertAcknowledged {
            id: 4,
            auto: true,
            reason: "auto: value normalized".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "alert_acknowledged");
        assert_eq!(json["auto"], true);

        let ev = GatewayEvent::TelemetryUpdate {
            unit_id: 2,
            timestamp: Utc::now(),
            values: vec![],
            status: crate::types::DeviceStatus::Online,
            measurement_ids: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "telemetry_update");
        // Internal bookkeeping must not leak onto the wire.
        assert!(json.get("measurement_ids").is_none());
    }
}
