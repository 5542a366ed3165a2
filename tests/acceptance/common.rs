//! Common harness for acceptance tests.
//!
//! Launches the complete gateway core in-process over a simulated bus:
//! master actor, device manager, polling worker, and alert engine, all
//! sharing one event bus and one in-memory database. Timings are scaled
//! down so a full offline/recovery cycle fits in a test.

#![allow(dead_code)] // Shared across scenario modules with different needs

use gateway_alert::{spawn_alert_engine, AlertEngineConfig};
use gateway_common::events::{EventBus, GatewayEvent};
use gateway_common::types::Capabilities;
use gateway_device::manager::{DeviceManager, DeviceManagerConfig};
use gateway_device::poller::{spawn_poller, PollerConfig, PollerHandle};
use gateway_device::registry::DeviceRegistry;
use gateway_modbus::sim::{SimBehavior, SimLink, SimSlave};
use gateway_modbus::{spawn_master, BusHandle, MasterConfig};
use gateway_store::Store;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Inertial-only device capabilities.
pub const MPU_CAPS: u16 =
    Capabilities::RS485 | Capabilities::MPU6050 | Capabilities::IDENTIFY;

/// Everything-fitted device capabilities.
pub const FULL_CAPS: u16 = MPU_CAPS | Capabilities::WIND | Capabilities::LOAD;

/// Scaled-down poll interval used by every scenario.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A complete gateway core running over a simulated bus.
pub struct Gateway {
    pub manager: DeviceManager,
    pub poller: PollerHandle,
    pub store: Store,
    pub events: EventBus,
    pub bus: BusHandle,
    pub slaves: Arc<Mutex<Vec<SimSlave>>>,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Launch the stack with the given slave bank.
    pub fn launch(units: &[(u8, u16)]) -> Self {
        let link = SimLink::default();
        for &(unit_id, caps) in units {
            link.add_slave(SimSlave::new(unit_id, caps));
        }
        let slaves = link.slaves();
        let (bus, _bus_join) = spawn_master(link, MasterConfig::default());

        let store = Store::open_in_memory().expect("in-memory store");
        let registry = Arc::new(DeviceRegistry::new());
        let events = EventBus::default();
        let manager = DeviceManager::new(
            bus.clone(),
            Arc::clone(&registry),
            store.clone(),
            events.clone(),
            DeviceManagerConfig {
                request_timeout: Duration::from_millis(50),
                probe_timeout: Duration::from_millis(20),
                probe_retries: 1,
            },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (alert_tx, alert_rx) = mpsc::channel(64);

        spawn_alert_engine(
            store.clone(),
            Arc::clone(&registry),
            events.clone(),
            alert_rx,
            AlertEngineConfig {
                debounce_window: Duration::from_millis(300),
                offline_deadline: Duration::from_millis(150),
                watch_interval: Duration::from_millis(25),
            },
            shutdown_rx.clone(),
        );

        let (poller, _poller_join) = spawn_poller(
            manager.clone(),
            store.clone(),
            events.clone(),
            alert_tx,
            PollerConfig {
                interval: POLL_INTERVAL,
                inter_frame_delay: Duration::from_millis(1),
                request_timeout: Duration::from_millis(50),
            },
            shutdown_rx,
        );

        Self {
            manager,
            poller,
            store,
            events,
            bus,
            slaves,
            shutdown: shutdown_tx,
        }
    }

    /// Point a raw input register of one slave at a new value.
    pub fn set_input(&self, unit_id: u8, addr: u16, raw: u16) {
        let mut slaves = self.slaves.lock().expect("slaves lock");
        let slave = slaves
            .iter_mut()
            .find(|s| s.unit_id == unit_id)
            .expect("slave present");
        slave.set_input(addr, raw);
    }

    /// Switch a slave's fault-injection mode.
    pub fn set_behavior(&self, unit_id: u8, behavior: SimBehavior) {
        let mut slaves = self.slaves.lock().expect("slaves lock");
        let slave = slaves
            .iter_mut()
            .find(|s| s.unit_id == unit_id)
            .expect("slave present");
        slave.behavior = behavior;
    }

    /// Read back a holding register of one slave.
    pub fn slave_holding(&self, unit_id: u8, addr: u16) -> u16 {
        let slaves = self.slaves.lock().expect("slaves lock");
        slaves
            .iter()
            .find(|s| s.unit_id == unit_id)
            .expect("slave present")
            .holding(addr)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Await the first event matching `predicate`, up to `deadline`.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<GatewayEvent>,
    deadline: Duration,
    mut predicate: F,
) -> Option<GatewayEvent>
where
    F: FnMut(&GatewayEvent) -> bool,
{
    let timeout = tokio::time::sleep(deadline);
    tokio::pin!(timeout);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            },
            _ = &mut timeout => return None,
        }
    }
}
