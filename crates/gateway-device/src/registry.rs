//! In-memory device cache.
//!
//! Writes happen on the device-manager and polling paths; readers take
//! cloned snapshots so the hot polling loop never holds a lock across a
//! bus transaction.

use chrono::{DateTime, Utc};
use gateway_common::types::{Device, DeviceStatus};
use std::collections::HashMap;
use std::sync::RwLock;

/// Consecutive failures before a device is declared offline.
pub const OFFLINE_THRESHOLD: u32 = 3;

/// Connectivity transition produced by a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    /// The device became reachable.
    CameOnline,
    /// The device crossed the consecutive-failure threshold.
    WentOffline,
}

/// Shared device cache keyed by unit id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: RwLock<HashMap<u8, Device>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry, typically from persistence at startup. Seeded
    /// devices start with unknown connectivity regardless of their stored
    /// last-seen time.
    pub fn load(&self, devices: Vec<Device>) {
        let mut map = self.write();
        for mut device in devices {
            device.status = DeviceStatus::Unknown;
            device.consecutive_errors = 0;
            map.insert(device.unit_id, device);
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u8, Device>> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u8, Device>> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Immutable snapshot of every device, ordered by unit id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.read().values().cloned().collect();
        devices.sort_by_key(|d| d.unit_id);
        devices
    }

    /// One device by unit id.
    #[must_use]
    pub fn get(&self, unit_id: u8) -> Option<Device> {
        self.read().get(&unit_id).cloned()
    }

    /// Whether a unit id is cached.
    #[must_use]
    pub fn contains(&self, unit_id: u8) -> bool {
        self.read().contains_key(&unit_id)
    }

    /// Insert or replace a device.
    pub fn upsert(&self, device: Device) {
        self.write().insert(device.unit_id, device);
    }

    /// Update the alias of a cached device.
    pub fn set_alias(&self, unit_id: u8, alias: &str) {
        if let Some(device) = self.write().get_mut(&unit_id) {
            device.alias = alias.to_string();
        }
    }

    /// Move a device to a new unit id. Returns false when the old id is
    /// unknown or the new id is already taken.
    pub fn rekey(&self, old_unit_id: u8, new_unit_id: u8) -> bool {
        let mut map = self.write();
        if map.contains_key(&new_unit_id) {
            return false;
        }
        match map.remove(&old_unit_id) {
            Some(mut device) => {
                device.unit_id = new_unit_id;
                map.insert(new_unit_id, device);
                true
            }
            None => false,
        }
    }

    /// Record a successful transaction: refresh last-seen, clear the error
    /// counter, and report a transition when the device was not online.
    pub fn record_success(&self, unit_id: u8, seen: DateTime<Utc>) -> Option<StatusTransition> {
        let mut map = self.write();
        let device = map.get_mut(&unit_id)?;
        device.last_seen = Some(seen);
        device.consecutive_errors = 0;
        if device.status == DeviceStatus::Online {
            None
        } else {
            device.status = DeviceStatus::Online;
            Some(StatusTransition::CameOnline)
        }
    }

    /// Record a failed transaction: bump the error counter and report a
    /// transition exactly when the threshold is crossed while online.
    pub fn record_failure(&self, unit_id: u8) -> Option<StatusTransition> {
        let mut map = self.write();
        let device = map.get_mut(&unit_id)?;
        device.consecutive_errors += 1;
        if device.consecutive_errors == OFFLINE_THRESHOLD && device.status == DeviceStatus::Online {
            device.status = DeviceStatus::Offline;
            Some(StatusTransition::WentOffline)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online_device(unit_id: u8) -> Device {
        let mut device = Device::new(unit_id);
        device.status = DeviceStatus::Online;
        device
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let registry = DeviceRegistry::new();
        registry.upsert(Device::new(16));
        registry.upsert(Device::new(2));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].unit_id, 2);
        assert_eq!(snapshot[1].unit_id, 16);
    }

    #[test]
    fn test_first_success_comes_online() {
        let registry = DeviceRegistry::new();
        registry.upsert(Device::new(2));
        assert_eq!(
            registry.record_success(2, Utc::now()),
            Some(StatusTransition::CameOnline)
        );
        // Second success is not a transition.
        assert_eq!(registry.record_success(2, Utc::now()), None);
        assert_eq!(registry.get(2).unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn test_offline_after_three_failures_exactly_once() {
        let registry = DeviceRegistry::new();
        registry.upsert(online_device(16));

        assert_eq!(registry.record_failure(16), None);
        assert_eq!(registry.record_failure(16), None);
        assert_eq!(
            registry.record_failure(16),
            Some(StatusTransition::WentOffline)
        );
        // Further failures do not re-emit.
        assert_eq!(registry.record_failure(16), None);
        assert_eq!(registry.get(16).unwrap().consecutive_errors, 4);
    }

    #[test]
    fn test_recovery_emits_online_once() {
        let registry = DeviceRegistry::new();
        registry.upsert(online_device(16));
        for _ in 0..3 {
            registry.record_failure(16);
        }
        assert_eq!(registry.get(16).unwrap().status, DeviceStatus::Offline);

        assert_eq!(
            registry.record_success(16, Utc::now()),
            Some(StatusTransition::CameOnline)
        );
        assert_eq!(registry.get(16).unwrap().consecutive_errors, 0);
    }

    #[test]
    fn test_failures_before_first_success_stay_unknown() {
        let registry = DeviceRegistry::new();
        registry.upsert(Device::new(5));
        for _ in 0..5 {
            assert_eq!(registry.record_failure(5), None);
        }
        assert_eq!(registry.get(5).unwrap().status, DeviceStatus::Unknown);
    }

    #[test]
    fn test_rekey() {
        let registry = DeviceRegistry::new();
        registry.upsert(Device::new(2));
        registry.upsert(Device::new(3));

        assert!(!registry.rekey(2, 3), "duplicate target rejected");
        assert!(registry.rekey(2, 9));
        assert!(!registry.contains(2));
        assert_eq!(registry.get(9).unwrap().unit_id, 9);
    }

    #[test]
    fn test_load_resets_runtime_state() {
        let registry = DeviceRegistry::new();
        let mut device = online_device(2);
        device.consecutive_errors = 7;
        registry.load(vec![device]);
        let loaded = registry.get(2).unwrap();
        assert_eq!(loaded.status, DeviceStatus::Unknown);
        assert_eq!(loaded.consecutive_errors, 0);
    }
}
