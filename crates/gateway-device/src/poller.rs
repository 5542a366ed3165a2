//! Cyclic telemetry polling worker.
//!
//! One task iterates the selected devices on a cadence, reads each
//! device's capability-sized input-register block through the bus master,
//! normalizes it, and fans the sample out to persistence, the alert
//! engine, and the event bus. Commands (start/stop/status) arrive over a
//! channel and take effect between transactions, never inside one.

use crate::manager::DeviceManager;
use crate::normalize::{normalize, required_register_count};
use chrono::Utc;
use gateway_modbus::BusError;
use gateway_common::error::{GatewayError, GatewayResult};
use gateway_common::events::{EventBus, GatewayEvent};
use gateway_common::types::{DeviceStatus, NormalizedSample, Quality};
use gateway_store::Store;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Polling cadence and timing knobs.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Global poll interval.
    pub interval: Duration,
    /// Pause between successive devices within one tick.
    pub inter_frame_delay: Duration,
    /// Per-transaction timeout.
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            inter_frame_delay: Duration::from_millis(10),
            request_timeout: Duration::from_millis(300),
        }
    }
}

/// Snapshot of the polling worker state.
#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    /// Whether a surveillance set is being polled.
    pub running: bool,
    /// Devices under surveillance, in polling order.
    pub unit_ids: Vec<u8>,
    /// Active interval in seconds.
    pub interval_sec: u64,
    /// Completed ticks since the last start.
    pub ticks: u64,
}

enum Command {
    Start {
        unit_ids: Vec<u8>,
        interval: Option<Duration>,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<PollerStatus>,
    },
}

/// Cloneable handle for controlling the polling worker.
#[derive(Clone)]
pub struct PollerHandle {
    tx: mpsc::Sender<Command>,
}

fn worker_gone<T>(_: T) -> GatewayError {
    GatewayError::Io("polling worker stopped".into())
}

impl PollerHandle {
    /// Start polling the given devices, replacing any prior surveillance
    /// set. An empty list selects every cached device.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker is gone.
    pub async fn start(
        &self,
        unit_ids: Vec<u8>,
        interval: Option<Duration>,
    ) -> GatewayResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Start {
                unit_ids,
                interval,
                reply,
            })
            .await
            .map_err(worker_gone)?;
        rx.await.map_err(worker_gone)
    }

    /// Stop polling. The in-flight transaction, if any, completes first.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker is gone.
    pub async fn stop(&self) -> GatewayResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stop { reply })
            .await
            .map_err(worker_gone)?;
        rx.await.map_err(worker_gone)
    }

    /// Current worker state.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker is gone.
    pub async fn status(&self) -> GatewayResult<PollerStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(worker_gone)?;
        rx.await.map_err(worker_gone)
    }
}

struct PollState {
    running: bool,
    unit_ids: Vec<u8>,
    interval: Duration,
    ticks: u64,
}

struct Poller {
    manager: DeviceManager,
    store: Store,
    events: EventBus,
    alert_tx: mpsc::Sender<NormalizedSample>,
    config: PollerConfig,
    rx: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
}

/// Spawn the polling worker.
pub fn spawn_poller(
    manager: DeviceManager,
    store: Store,
    events: EventBus,
    alert_tx: mpsc::Sender<NormalizedSample>,
    config: PollerConfig,
    shutdown: watch::Receiver<bool>,
) -> (PollerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(8);
    let poller = Poller {
        manager,
        store,
        events,
        alert_tx,
        config,
        rx,
        shutdown,
    };
    let join = tokio::spawn(poller.run());
    (PollerHandle { tx }, join)
}

impl Poller {
    async fn run(mut self) {
        let mut state = PollState {
            running: false,
            unit_ids: Vec::new(),
            interval: self.config.interval,
            ticks: 0,
        };
        let mut next_tick = Instant::now();

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let was_running = state.running;
                    self.apply(cmd, &mut state);
                    if state.running && !was_running {
                        next_tick = Instant::now();
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(next_tick), if state.running => {
                    let started = Instant::now();
                    self.tick(&mut state).await;
                    if state.running {
                        state.ticks += 1;
                    }
                    // Sleep only the remainder; a tick that overran its
                    // interval starts the next one immediately instead of
                    // queueing missed ticks.
                    let elapsed = started.elapsed();
                    next_tick = Instant::now() + state.interval.saturating_sub(elapsed);
                }
            }
        }
        info!("polling worker stopped");
    }

    fn apply(&self, cmd: Command, state: &mut PollState) {
        match cmd {
            Command::Start {
                unit_ids,
                interval,
                reply,
            } => {
                let mut ids = if unit_ids.is_empty() {
                    self.manager
                        .registry()
                        .snapshot()
                        .iter()
                        .map(|d| d.unit_id)
                        .collect()
                } else {
                    unit_ids
                };
                ids.sort_unstable();
                ids.dedup();
                if let Some(interval) = interval {
                    state.interval = interval;
                }
                state.unit_ids = ids;
                state.running = true;
                state.ticks = 0;
                info!(
                    units = ?state.unit_ids,
                    interval = ?state.interval,
                    "polling started"
                );
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                if state.running {
                    info!("polling stopped");
                }
                state.running = false;
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(PollerStatus {
                    running: state.running,
                    unit_ids: state.unit_ids.clone(),
                    interval_sec: state.interval.as_secs(),
                    ticks: state.ticks,
                });
            }
        }
    }

    async fn tick(&mut self, state: &mut PollState) {
        let units = state.unit_ids.clone();
        for (i, &unit_id) in units.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.inter_frame_delay).await;
            }
            self.poll_device(unit_id).await;

            // Drain control traffic so a stop lands between transactions.
            while let Ok(cmd) = self.rx.try_recv() {
                self.apply(cmd, state);
            }
            if !state.running || *self.shutdown.borrow() {
                return;
            }
        }
    }

    async fn poll_device(&self, unit_id: u8) {
        let Some(device) = self.manager.registry().get(unit_id) else {
            return;
        };
        let count = required_register_count(device.capabilities);
        if count == 0 {
            return;
        }

        let timeout = self.config.request_timeout;
        let bus = self.manager.bus();
        let read = match bus.read_input(unit_id, 0, count, timeout).await {
            Ok(regs) => Ok(regs),
            // Only silence and framing damage get the immediate second
            // attempt; exception replies and a closed port do not.
            Err(first @ (BusError::Exception { .. } | BusError::BusClosed(_))) => Err(first),
            Err(first) => {
                debug!(unit_id, error = %first, "telemetry read failed, retrying once");
                bus.read_input(unit_id, 0, count, timeout).await
            }
        };

        let regs = match read {
            Ok(regs) => regs,
            Err(e) => {
                debug!(unit_id, error = %e, "telemetry read failed");
                self.manager.record_poll_failure(unit_id);
                return;
            }
        };

        let now = Utc::now();
        let mut sample = normalize(&device, &regs, now);

        // The wire transaction succeeded even when decoding did not.
        self.manager.record_poll_success(unit_id, now);

        if sample.quality == Quality::ErrorComms {
            warn!(unit_id, "telemetry decode failed, sample discarded");
            return;
        }

        if let Err(e) = self.store.touch_device(unit_id, now) {
            warn!(unit_id, error = %e, "last-seen update failed");
        }

        // Upgrade quality to ALARM where a configured threshold is
        // violated; the alert engine decides on alert rows separately.
        for value in &mut sample.values {
            if let Ok(Some((lo, hi))) = self.store.sensor_thresholds(&value.sensor_id) {
                let breached = hi.is_some_and(|h| value.value > h)
                    || lo.is_some_and(|l| value.value < l);
                if breached {
                    value.quality = Quality::Alarm;
                    sample.quality = Quality::Alarm;
                }
            }
        }

        // Fan-out order: persistence, alert engine, then push/publish.
        let mut measurement_ids = Vec::with_capacity(sample.values.len());
        for value in &sample.values {
            match self.store.insert_measurement(sample.timestamp, value) {
                Ok(id) => measurement_ids.push(id),
                Err(e) => {
                    // Storage trouble must not silence the live consumers.
                    warn!(unit_id, sensor = %value.sensor_id, error = %e, "measurement not persisted");
                }
            }
        }

        if self.alert_tx.send(sample.clone()).await.is_err() {
            debug!("alert engine receiver gone");
        }

        let status = self
            .manager
            .registry()
            .get(unit_id)
            .map_or(DeviceStatus::Online, |d| d.status);
        self.events.publish(GatewayEvent::TelemetryUpdate {
            unit_id,
            timestamp: sample.timestamp,
            values: sample.values,
            status,
            measurement_ids,
        });
    }
}
