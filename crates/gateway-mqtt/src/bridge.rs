//! The bridge worker: connection lifecycle and event publishing.
//!
//! The worker subscribes to the in-process event bus; while the broker is
//! unreachable, events accumulate in the bounded broadcast ring and the
//! oldest are shed first, so a dead broker can never back-pressure the
//! polling loop. The rumqttc event loop runs in its own task, keeping the
//! request channel drained while the bridge awaits publishes. On every
//! (re)connect the bridge publishes the inventory, one connect event per
//! known device, and drains the unsent-measurement backlog before
//! resuming live traffic.

use crate::topics::{
    alert_payload, attributes_payload, connectivity_payload, telemetry_payload, TopicTemplates,
};
use gateway_common::config::MqttConfig;
use gateway_common::events::{EventBus, GatewayEvent};
use gateway_device::registry::DeviceRegistry;
use gateway_store::Store;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnect backoff floor.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
/// Reconnect backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Unsent-measurement rows drained per (re)connect.
const BACKLOG_BATCH: usize = 500;
/// rumqttc request channel depth.
const REQUEST_CHANNEL: usize = 64;

enum ConnEvent {
    Connected,
    Lost(String),
}

struct MqttBridge {
    config: MqttConfig,
    topics: TopicTemplates,
    store: Store,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    shutdown: watch::Receiver<bool>,
}

/// Spawn the bridge worker. A disabled configuration spawns a task that
/// exits immediately.
pub fn spawn_bridge(
    config: MqttConfig,
    store: Store,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let topics = TopicTemplates::new(&config.topic_prefix);
    let bridge = MqttBridge {
        config,
        topics,
        store,
        registry,
        events,
        shutdown,
    };
    tokio::spawn(bridge.run())
}

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

impl MqttBridge {
    fn build_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keepalive);
        if let (Some(user), Some(pass)) =
            (self.config.username.clone(), self.config.password.clone())
        {
            options.set_credentials(user, pass);
        }
        options
    }

    async fn run(mut self) {
        if !self.config.enabled {
            info!("MQTT bridge disabled");
            return;
        }

        let qos = qos_from(self.config.qos);
        let mut backoff = BACKOFF_MIN;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let (client, mut eventloop) = AsyncClient::new(self.build_options(), REQUEST_CHANNEL);

            // The event loop polls in its own task so the request channel
            // keeps draining while we await publishes.
            let (conn_tx, mut conn_rx) = mpsc::channel::<ConnEvent>(8);
            let poll_task = tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            if conn_tx.send(ConnEvent::Connected).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = conn_tx.send(ConnEvent::Lost(e.to_string())).await;
                            break;
                        }
                    }
                }
            });

            let mut events_rx = self.events.subscribe();
            let mut connected = false;

            info!(
                host = %self.config.host,
                port = self.config.port,
                "connecting to MQTT broker"
            );

            loop {
                tokio::select! {
                    changed = self.shutdown.changed() => {
                        if changed.is_err() || *self.shutdown.borrow() {
                            let _ = client.disconnect().await;
                            poll_task.abort();
                            info!("MQTT bridge stopped");
                            return;
                        }
                    }
                    conn = conn_rx.recv() => match conn {
                        Some(ConnEvent::Connected) => {
                            info!("MQTT connected");
                            connected = true;
                            backoff = BACKOFF_MIN;
                            self.publish_birth(&client, qos).await;
                        }
                        Some(ConnEvent::Lost(e)) => {
                            warn!(error = %e, "MQTT connection lost");
                            break;
                        }
                        None => break,
                    },
                    event = events_rx.recv(), if connected => match event {
                        Ok(event) => self.publish_event(&client, qos, &event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // The bounded outbound buffer overflowed; the
                            // oldest events were shed.
                            warn!(dropped = n, "MQTT outbound buffer overflow");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = client.disconnect().await;
                            poll_task.abort();
                            return;
                        }
                    },
                }
            }

            poll_task.abort();

            // Exponential backoff with jitter before the next attempt.
            let jitter = rand::thread_rng().gen_range(0.0..0.25);
            let delay = backoff.mul_f64(1.0 + jitter);
            debug!(delay = ?delay, "MQTT reconnect backoff");
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// Initial publishes after a (re)connect: inventory attributes, one
    /// connect event per known device, then the unsent backlog.
    async fn publish_birth(&self, client: &AsyncClient, qos: QoS) {
        let devices = self.registry.snapshot();

        let mut inventory = Vec::with_capacity(devices.len());
        for device in &devices {
            let sensors = self.store.get_sensors(device.unit_id).unwrap_or_default();
            inventory.push((device.clone(), sensors));
        }
        self.publish(
            client,
            self.topics.gateway_attributes(),
            qos,
            attributes_payload(&inventory).to_string(),
        )
        .await;

        for device in &devices {
            self.publish(
                client,
                self.topics.gateway_connect(),
                qos,
                connectivity_payload(&device.display_name()).to_string(),
            )
            .await;
        }

        self.drain_backlog(client, qos).await;
    }

    /// Publish measurements that never made it to the broker, oldest
    /// first, and flag them as sent.
    async fn drain_backlog(&self, client: &AsyncClient, qos: QoS) {
        let backlog = match self.store.get_unsent_measurements(BACKLOG_BATCH) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "unsent backlog query failed");
                return;
            }
        };
        if backlog.is_empty() {
            return;
        }
        info!(count = backlog.len(), "draining unsent measurement backlog");

        let mut sent = Vec::with_capacity(backlog.len());
        for row in backlog {
            let device_id = match self.store.get_sensor(&row.sensor_id) {
                Ok(Some(sensor)) => TopicTemplates::device_id(sensor.unit_id),
                _ => continue,
            };
            let payload = serde_json::json!({
                "timestamp": row.timestamp.timestamp_millis(),
                "device_id": device_id,
                "sensor_id": row.sensor_id,
                "sensor_type": row.kind.as_str(),
                "value": row.value,
                "unit": row.unit,
                "quality": row.quality.to_string(),
            });
            let topic = self.topics.telemetry(&device_id, row.kind.as_str());
            self.publish(client, topic, qos, payload.to_string()).await;
            sent.push(row.id);
        }
        if let Err(e) = self.store.mark_sent(&sent) {
            warn!(error = %e, "marking backlog sent failed");
        }
    }

    async fn publish_event(&self, client: &AsyncClient, qos: QoS, event: &GatewayEvent) {
        match event {
            GatewayEvent::TelemetryUpdate {
                unit_id,
                timestamp,
                values,
                measurement_ids,
                ..
            } => {
                let device_id = TopicTemplates::device_id(*unit_id);
                for value in values {
                    let topic = self.topics.telemetry(&device_id, value.kind.as_str());
                    self.publish(
                        client,
                        topic,
                        qos,
                        telemetry_payload(*timestamp, &device_id, value).to_string(),
                    )
                    .await;
                }
                if let Err(e) = self.store.mark_sent(measurement_ids) {
                    warn!(error = %e, "marking measurements sent failed");
                }
            }
            GatewayEvent::DeviceOnline { device, .. } => {
                self.publish(
                    client,
                    self.topics.gateway_connect(),
                    qos,
                    connectivity_payload(device).to_string(),
                )
                .await;
            }
            GatewayEvent::DeviceOffline { device, .. } => {
                self.publish(
                    client,
                    self.topics.gateway_disconnect(),
                    qos,
                    connectivity_payload(device).to_string(),
                )
                .await;
            }
            GatewayEvent::NewAlert { alert } => {
                let device_id = self.alert_device_id(alert);
                self.publish(
                    client,
                    self.topics.alerts(&device_id),
                    qos,
                    alert_payload(alert).to_string(),
                )
                .await;
            }
            GatewayEvent::AlertAcknowledged { id, .. } => {
                // Republish the row with its acknowledgement state.
                let Ok(Some(alert)) = self.store.get_alert(*id) else {
                    return;
                };
                let device_id = self.alert_device_id(&alert);
                self.publish(
                    client,
                    self.topics.alerts(&device_id),
                    qos,
                    alert_payload(&alert).to_string(),
                )
                .await;
            }
        }
    }

    /// Resolve the topic device id for an alert: through its sensor when
    /// sensor-scoped, the stored device key otherwise.
    fn alert_device_id(&self, alert: &gateway_common::types::Alert) -> String {
        alert
            .sensor_id
            .as_deref()
            .and_then(|sensor_id| match self.store.get_sensor(sensor_id) {
                Ok(Some(sensor)) => Some(TopicTemplates::device_id(sensor.unit_id)),
                _ => None,
            })
            .or_else(|| alert.rig_id.clone())
            .unwrap_or_else(|| "gateway".into())
    }

    async fn publish(&self, client: &AsyncClient, topic: String, qos: QoS, payload: String) {
        if let Err(e) = client.publish(topic.clone(), qos, false, payload).await {
            warn!(topic, error = %e, "MQTT publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        // Out-of-range values fall back to the default QoS 1.
        assert_eq!(qos_from(9), QoS::AtLeastOnce);
    }
}
