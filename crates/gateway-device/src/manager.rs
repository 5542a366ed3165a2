//! Operator-facing device commands and the discovery engine.
//!
//! Every operation here consumes the bus master and therefore serializes
//! against polling traffic; the master's FIFO queue interleaves commands
//! between polling transactions, never inside one.

use crate::identity::{
    alias_write_block, apply_identity, decode_identity, unpack_ascii, validate_alias,
};
use crate::normalize::register_for;
use crate::registry::{DeviceRegistry, StatusTransition};
use chrono::{DateTime, Utc};
use gateway_common::error::{GatewayError, GatewayResult};
use gateway_common::events::{EventBus, GatewayEvent};
use gateway_common::types::{Device, Sensor, SensorKind};
use gateway_modbus::registers::{holding, ALIAS_MAX_BYTES, EEPROM_SAVE_MAGIC, IDENTITY_BLOCK_WORDS};
use gateway_modbus::{BusError, BusHandle, MAX_UNIT_ID};
use gateway_store::Store;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing knobs for device operations.
#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    /// Per-transaction timeout for operational traffic.
    pub request_timeout: Duration,
    /// Shorter per-probe timeout used during discovery.
    pub probe_timeout: Duration,
    /// Probe retries per candidate unit id.
    pub probe_retries: u32,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(80),
            probe_retries: 1,
        }
    }
}

/// Authoritative device cache plus the command executor.
#[derive(Clone)]
pub struct DeviceManager {
    bus: BusHandle,
    registry: Arc<DeviceRegistry>,
    store: Store,
    events: EventBus,
    config: DeviceManagerConfig,
}

impl DeviceManager {
    /// Wire up the manager.
    #[must_use]
    pub fn new(
        bus: BusHandle,
        registry: Arc<DeviceRegistry>,
        store: Store,
        events: EventBus,
        config: DeviceManagerConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            store,
            events,
            config,
        }
    }

    /// The shared device cache.
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The bus handle used for commands.
    #[must_use]
    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    /// Scan a unit id range for live slaves.
    ///
    /// Each candidate gets a minimal vendor-register probe with the short
    /// discovery timeout; responders get a full identity read and are
    /// upserted into the cache and the database together with their
    /// capability-implied sensors.
    ///
    /// # Errors
    ///
    /// Returns an error when the range is invalid or the bus goes away
    /// mid-scan. Individual unresponsive candidates are skipped silently.
    pub async fn discover(&self, range: RangeInclusive<u8>) -> GatewayResult<Vec<Device>> {
        let (min, max) = (*range.start(), *range.end());
        if min == 0 || max > MAX_UNIT_ID || min > max {
            return Err(GatewayError::Validation(format!(
                "discovery range {min}..={max} must fall within 1..=247"
            )));
        }

        info!(min, max, "discovery scan started");
        let mut found = Vec::new();

        for unit_id in range {
            if !self.probe(unit_id).await? {
                continue;
            }
            match self.read_full_identity(unit_id).await {
                Ok(device) => {
                    debug!(
                        unit_id,
                        vendor = device.vendor_code,
                        caps = %device.capabilities,
                        "device identified"
                    );
                    self.commit_discovered(&device)?;
                    found.push(device);
                }
                Err(e) => {
                    warn!(unit_id, error = %e, "probe answered but identity read failed");
                }
            }
        }

        info!(count = found.len(), "discovery scan finished");
        Ok(found)
    }

    /// Minimal probe: read the vendor-id register with the short timeout.
    /// Timeouts and framing errors mean "nobody there"; a dead bus aborts
    /// the scan.
    async fn probe(&self, unit_id: u8) -> GatewayResult<bool> {
        for attempt in 0..=self.config.probe_retries {
            match self
                .bus
                .read_holding(unit_id, holding::VENDOR_ID, 1, self.config.probe_timeout)
                .await
            {
                Ok(_) => return Ok(true),
                Err(BusError::BusClosed(e)) => return Err(GatewayError::Bus(e)),
                Err(BusError::Timeout(_)) => {}
                Err(e) => {
                    debug!(unit_id, attempt, error = %e, "probe error");
                }
            }
        }
        Ok(false)
    }

    /// Read the identity block, optional name strings, and the alias.
    async fn read_full_identity(&self, unit_id: u8) -> GatewayResult<Device> {
        let timeout = self.config.request_timeout;
        let words = self
            .bus
            .read_holding(unit_id, holding::VENDOR_ID, IDENTITY_BLOCK_WORDS, timeout)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;
        let block = decode_identity(&words)?;

        let mut device = self
            .registry
            .get(unit_id)
            .unwrap_or_else(|| Device::new(unit_id));
        apply_identity(&mut device, &block);

        // Extended name strings are optional on older firmware; a refusal
        // or timeout just leaves them empty.
        device.vendor_name = self
            .read_name_string(unit_id, holding::VENDOR_STR_LEN)
            .await
            .unwrap_or_default();
        device.product_name = self
            .read_name_string(unit_id, holding::PRODUCT_STR_LEN)
            .await
            .unwrap_or_default();
        device.alias = self.read_alias(unit_id).await?;

        Ok(device)
    }

    async fn read_name_string(&self, unit_id: u8, len_addr: u16) -> Option<String> {
        let timeout = self.config.request_timeout;
        let words = self
            .bus
            .read_holding(unit_id, len_addr, 1 + holding::NAME_STR_WORDS, timeout)
            .await
            .ok()?;
        let len = (words[0] as usize).min(holding::NAME_STR_WORDS as usize * 2);
        Some(unpack_ascii(&words[1..], len))
    }

    async fn read_alias(&self, unit_id: u8) -> GatewayResult<String> {
        let timeout = self.config.request_timeout;
        let len_word = self
            .bus
            .read_holding(unit_id, holding::ALIAS_LEN, 1, timeout)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;

        // Clamp to the stored length, never the 64-byte maximum.
        let len = (len_word[0] as usize).min(ALIAS_MAX_BYTES);
        if len == 0 {
            return Ok(String::new());
        }

        let words = self
            .bus
            .read_holding(
                unit_id,
                holding::ALIAS_DATA,
                len.div_ceil(2) as u16,
                timeout,
            )
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;
        Ok(unpack_ascii(&words, len))
    }

    /// Upsert a discovered device into cache and storage, provision its
    /// sensors, and emit the online transition.
    fn commit_discovered(&self, device: &Device) -> GatewayResult<()> {
        self.registry.upsert(device.clone());
        if let Some(StatusTransition::CameOnline) =
            self.registry.record_success(device.unit_id, Utc::now())
        {
            self.events.publish(GatewayEvent::DeviceOnline {
                unit_id: device.unit_id,
                device: device.display_name(),
            });
        }

        self.store
            .upsert_device(device)
            .map_err(|e| GatewayError::Storage(e.to_string()))?;

        for kind in SensorKind::for_capabilities(device.capabilities) {
            let (alarm_lo, alarm_hi) = kind.default_thresholds();
            let sensor = Sensor {
                sensor_id: kind.sensor_id(device.unit_id),
                unit_id: device.unit_id,
                kind,
                unit: kind.unit().to_string(),
                register: register_for(kind),
                alarm_lo,
                alarm_hi,
                created_at: Utc::now(),
            };
            self.store
                .upsert_sensor(&sensor)
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    /// Blink the identify LED on a device for `seconds`.
    ///
    /// # Errors
    ///
    /// Rejects broadcast and unknown devices; surfaces bus failures.
    pub async fn identify(&self, unit_id: u8, seconds: u16) -> GatewayResult<()> {
        if unit_id == 0 {
            return Err(GatewayError::Validation(
                "identify does not accept broadcast".into(),
            ));
        }
        if !self.registry.contains(unit_id) {
            return Err(GatewayError::DeviceNotFound(unit_id));
        }
        self.bus
            .write_single(
                unit_id,
                holding::IDENTIFY_SECONDS,
                seconds,
                self.config.request_timeout,
            )
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;
        info!(unit_id, seconds, "identify LED requested");
        Ok(())
    }

    /// Write a new alias to the slave and persist it to its EEPROM.
    ///
    /// The cache and database are only updated once both the block write
    /// and the save command have succeeded, so a half-applied write never
    /// becomes visible.
    ///
    /// # Errors
    ///
    /// Rejects invalid aliases and unknown devices; surfaces bus failures.
    pub async fn set_alias(&self, unit_id: u8, alias: &str) -> GatewayResult<()> {
        validate_alias(alias)?;
        let mut device = self
            .registry
            .get(unit_id)
            .ok_or(GatewayError::DeviceNotFound(unit_id))?;

        let timeout = self.config.request_timeout;
        let block = alias_write_block(alias);
        self.bus
            .write_multiple(unit_id, holding::ALIAS_LEN, &block, timeout)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;
        self.bus
            .write_single(unit_id, holding::SAVE_COMMAND, EEPROM_SAVE_MAGIC, timeout)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;

        self.registry.set_alias(unit_id, alias);
        device.alias = alias.to_string();
        self.store
            .upsert_device(&device)
            .map_err(|e| GatewayError::Storage(e.to_string()))?;
        info!(unit_id, alias, "alias written and saved");
        Ok(())
    }

    /// Change a slave's unit id and persist it to its EEPROM. The cache
    /// re-keys; callers are advised to re-run discovery to confirm.
    ///
    /// # Errors
    ///
    /// Rejects out-of-range ids, duplicates against the cache, and unknown
    /// devices; surfaces bus failures.
    pub async fn set_unit_id(&self, unit_id: u8, new_unit_id: u8) -> GatewayResult<()> {
        if new_unit_id == 0 || new_unit_id > MAX_UNIT_ID {
            return Err(GatewayError::Validation(format!(
                "new unit id {new_unit_id} out of range 1..=247"
            )));
        }
        if new_unit_id == unit_id {
            return Err(GatewayError::Validation(
                "new unit id equals the current one".into(),
            ));
        }
        if self.registry.contains(new_unit_id) {
            return Err(GatewayError::Validation(format!(
                "unit id {new_unit_id} is already in use"
            )));
        }
        if !self.registry.contains(unit_id) {
            return Err(GatewayError::DeviceNotFound(unit_id));
        }

        let timeout = self.config.request_timeout;
        self.bus
            .write_single(
                unit_id,
                holding::UNIT_ID_CONFIG,
                u16::from(new_unit_id),
                timeout,
            )
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;
        self.bus
            .write_single(unit_id, holding::SAVE_COMMAND, EEPROM_SAVE_MAGIC, timeout)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;

        self.registry.rekey(unit_id, new_unit_id);
        self.store
            .rekey_device(unit_id, new_unit_id)
            .map_err(|e| GatewayError::Storage(e.to_string()))?;
        info!(unit_id, new_unit_id, "unit id changed and saved");
        Ok(())
    }

    /// Record a successful poll for a device, emitting the online
    /// transition when it recovers.
    pub fn record_poll_success(&self, unit_id: u8, seen: DateTime<Utc>) {
        if let Some(StatusTransition::CameOnline) = self.registry.record_success(unit_id, seen) {
            let name = self
                .registry
                .get(unit_id)
                .map_or_else(|| format!("UNIT_{unit_id}"), |d| d.display_name());
            info!(unit_id, "device online");
            self.events.publish(GatewayEvent::DeviceOnline {
                unit_id,
                device: name,
            });
        }
    }

    /// Record a failed poll for a device, emitting the offline transition
    /// on the third consecutive failure.
    pub fn record_poll_failure(&self, unit_id: u8) {
        if let Some(StatusTransition::WentOffline) = self.registry.record_failure(unit_id) {
            let name = self
                .registry
                .get(unit_id)
                .map_or_else(|| format!("UNIT_{unit_id}"), |d| d.display_name());
            warn!(unit_id, "device offline after repeated failures");
            self.events.publish(GatewayEvent::DeviceOffline {
                unit_id,
                device: name,
            });
        }
    }
}
