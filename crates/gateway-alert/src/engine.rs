//! The alert engine worker.
//!
//! Two inputs drive it: the measurement stream pushed by the polling
//! worker, and a periodic timer that walks the device cache for offline
//! deadlines. Alert state lives in two places: the database (durable) and
//! an in-memory active set keyed by `(key, code)` for debouncing and fast
//! auto-resolution. The in-memory set is rebuilt from the database at
//! startup and reconciled against it on every watcher tick so operator
//! acknowledgements made through the API are picked up.

use chrono::Utc;
use gateway_common::events::{EventBus, GatewayEvent};
use gateway_common::types::{AlertCode, AlertLevel, NormalizedSample};
use gateway_device::registry::DeviceRegistry;
use gateway_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Alert engine tuning knobs.
#[derive(Debug, Clone)]
pub struct AlertEngineConfig {
    /// Minimum spacing between two alerts of the same `(key, code)`.
    pub debounce_window: Duration,
    /// Silence after the last successful poll before a device counts as
    /// missing.
    pub offline_deadline: Duration,
    /// Cadence of the offline-deadline walker.
    pub watch_interval: Duration,
}

impl Default for AlertEngineConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(60),
            offline_deadline: Duration::from_secs(30),
            watch_interval: Duration::from_secs(10),
        }
    }
}

/// Canonical device key used for device-scoped alerts, stable across
/// alias changes.
fn device_key(unit_id: u8) -> String {
    format!("UNIT_{unit_id}")
}

struct AlertEngine {
    store: Store,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    rx: mpsc::Receiver<NormalizedSample>,
    shutdown: watch::Receiver<bool>,
    config: AlertEngineConfig,
    /// Active (unacknowledged) alert ids by `(key, code)`.
    active: HashMap<(String, AlertCode), i64>,
    /// Last creation instant by `(key, code)` for debouncing.
    last_created: HashMap<(String, AlertCode), Instant>,
}

/// Spawn the alert engine worker.
pub fn spawn_alert_engine(
    store: Store,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    rx: mpsc::Receiver<NormalizedSample>,
    config: AlertEngineConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let engine = AlertEngine {
        store,
        registry,
        events,
        rx,
        shutdown,
        config,
        active: HashMap::new(),
        last_created: HashMap::new(),
    };
    tokio::spawn(engine.run())
}

impl AlertEngine {
    async fn run(mut self) {
        self.rebuild_active();
        info!(active = self.active.len(), "alert engine started");

        let mut ticker = tokio::time::interval(self.config.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                sample = self.rx.recv() => {
                    let Some(sample) = sample else { break };
                    self.on_sample(&sample);
                }
                _ = ticker.tick() => {
                    self.reconcile_active();
                    self.check_offline_deadlines();
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("alert engine stopped");
    }

    /// Rebuild the active set from persistence (startup).
    fn rebuild_active(&mut self) {
        match self.store.get_active_alerts() {
            Ok(alerts) => {
                for alert in alerts {
                    let key = alert
                        .sensor_id
                        .clone()
                        .or_else(|| alert.rig_id.clone())
                        .unwrap_or_default();
                    self.active.insert((key, alert.code), alert.id);
                }
            }
            Err(e) => warn!(error = %e, "active alert rebuild failed"),
        }
    }

    /// Drop in-memory entries whose rows were acknowledged behind our back
    /// (operator acknowledgements go straight to the store).
    fn reconcile_active(&mut self) {
        let current = match self.store.get_active_alerts() {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(error = %e, "active alert reconcile failed");
                return;
            }
        };
        let live: std::collections::HashSet<i64> = current.iter().map(|a| a.id).collect();
        self.active.retain(|_, id| live.contains(id));
    }

    fn on_sample(&mut self, sample: &NormalizedSample) {
        // A successful measurement resolves a pending offline alert for
        // the device.
        self.auto_resolve(
            &device_key(sample.unit_id),
            AlertCode::DeviceOffline,
            "auto: device produced telemetry",
        );

        for value in &sample.values {
            let thresholds = match self.store.sensor_thresholds(&value.sensor_id) {
                Ok(Some(t)) => t,
                Ok(None) => continue,
                Err(e) => {
                    warn!(sensor = %value.sensor_id, error = %e, "threshold lookup failed");
                    continue;
                }
            };
            let (lo, hi) = thresholds;

            if let Some(hi) = hi.filter(|h| value.value > *h) {
                self.fire(
                    value.sensor_id.clone(),
                    AlertCode::ThresholdExceededHi,
                    AlertLevel::Alarm,
                    Some(value.sensor_id.as_str()),
                    None,
                    format!(
                        "{} is {:.2} {}, above threshold {:.2} {}",
                        value.sensor_id, value.value, value.unit, hi, value.unit
                    ),
                );
            } else if let Some(lo) = lo.filter(|l| value.value < *l) {
                self.fire(
                    value.sensor_id.clone(),
                    AlertCode::ThresholdExceededLo,
                    AlertLevel::Alarm,
                    Some(value.sensor_id.as_str()),
                    None,
                    format!(
                        "{} is {:.2} {}, below threshold {:.2} {}",
                        value.sensor_id, value.value, value.unit, lo, value.unit
                    ),
                );
            } else {
                // Back inside both thresholds: resolve whichever polarity
                // was active.
                self.auto_resolve(
                    &value.sensor_id,
                    AlertCode::ThresholdExceededHi,
                    "auto: value normalized",
                );
                self.auto_resolve(
                    &value.sensor_id,
                    AlertCode::ThresholdExceededLo,
                    "auto: value normalized",
                );
            }
        }
    }

    fn fire(
        &mut self,
        key: String,
        code: AlertCode,
        level: AlertLevel,
        sensor_id: Option<&str>,
        rig_id: Option<&str>,
        message: String,
    ) {
        let map_key = (key, code);

        // At most one active alert per (key, code).
        if self.active.contains_key(&map_key) {
            return;
        }
        // Debounce: identical firings within the window are dropped.
        if let Some(created) = self.last_created.get(&map_key) {
            if created.elapsed() < self.config.debounce_window {
                debug!(key = %map_key.0, code = %code, "alert debounced");
                return;
            }
        }

        match self
            .store
            .insert_alert(Utc::now(), sensor_id, rig_id, level, code, &message)
        {
            Ok(alert) => {
                info!(id = alert.id, code = %code, %message, "alert created");
                self.active.insert(map_key.clone(), alert.id);
                self.last_created.insert(map_key, Instant::now());
                self.events.publish(GatewayEvent::NewAlert { alert });
            }
            Err(e) => warn!(code = %code, error = %e, "alert insert failed"),
        }
    }

    fn auto_resolve(&mut self, key: &str, code: AlertCode, reason: &str) {
        let Some(id) = self.active.remove(&(key.to_string(), code)) else {
            return;
        };
        match self.store.acknowledge_alert(id, reason) {
            Ok(Some(alert)) => {
                // If an operator got there first the row carries their
                // reason; do not re-announce.
                if alert.ack_reason.as_deref() == Some(reason) {
                    info!(id, code = %code, reason, "alert auto-resolved");
                    self.events.publish(GatewayEvent::AlertAcknowledged {
                        id,
                        auto: true,
                        reason: reason.to_string(),
                    });
                }
            }
            Ok(None) => debug!(id, "alert row vanished before auto-resolution"),
            Err(e) => warn!(id, error = %e, "alert auto-resolution failed"),
        }
    }

    fn check_offline_deadlines(&mut self) {
        let now = Utc::now();
        let deadline =
            chrono::Duration::from_std(self.config.offline_deadline).unwrap_or_else(|_| {
                chrono::Duration::seconds(30)
            });

        for device in self.registry.snapshot() {
            let Some(last_seen) = device.last_seen else {
                continue;
            };
            if now - last_seen > deadline {
                let key = device_key(device.unit_id);
                self.fire(
                    key.clone(),
                    AlertCode::DeviceOffline,
                    AlertLevel::Warn,
                    None,
                    Some(key.as_str()),
                    format!(
                        "{} has not produced telemetry since {}",
                        device.display_name(),
                        last_seen.format("%Y-%m-%dT%H:%M:%S%.3fZ")
                    ),
                );
            }
        }
    }
}
