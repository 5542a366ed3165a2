//! SQLite-backed store.

use chrono::{DateTime, TimeZone, Utc};
use gateway_common::types::{
    Alert, AlertCode, AlertLevel, Capabilities, Device, Measurement, Quality, Sensor, SensorKind,
    SensorValue,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row failed to decode into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Convenience alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Aggregate row counts and database size.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    /// Device rows.
    pub devices: u64,
    /// Sensor rows.
    pub sensors: u64,
    /// Measurement rows.
    pub measurements: u64,
    /// Alert rows.
    pub alerts: u64,
    /// Alert rows with `ack = false`.
    pub active_alerts: u64,
    /// Database size in bytes.
    pub db_size_bytes: u64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS devices (
    unit_id                 INTEGER PRIMARY KEY,
    alias                   TEXT NOT NULL DEFAULT '',
    caps_json               TEXT NOT NULL DEFAULT '{}',
    rig_id                  TEXT,
    vendor_code             INTEGER NOT NULL DEFAULT 0,
    product_code            INTEGER NOT NULL DEFAULT 0,
    vendor_name             TEXT NOT NULL DEFAULT '',
    product_name            TEXT NOT NULL DEFAULT '',
    hw_version              INTEGER NOT NULL DEFAULT 0,
    fw_version              INTEGER NOT NULL DEFAULT 0,
    last_seen               INTEGER,
    poll_interval_override  INTEGER
);

CREATE TABLE IF NOT EXISTS sensors (
    sensor_id   TEXT PRIMARY KEY,
    unit_id     INTEGER NOT NULL REFERENCES devices(unit_id),
    type        TEXT NOT NULL,
    unit        TEXT NOT NULL,
    register    INTEGER NOT NULL,
    alarm_lo    REAL,
    alarm_hi    REAL,
    created_at  INTEGER NOT NULL,
    UNIQUE (unit_id, type)
);

CREATE TABLE IF NOT EXISTS measurements (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp      INTEGER NOT NULL,
    sensor_id      TEXT NOT NULL,
    type           TEXT NOT NULL,
    value          REAL NOT NULL,
    unit           TEXT NOT NULL,
    quality        TEXT NOT NULL DEFAULT 'OK',
    sent_to_cloud  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_measurements_timestamp
    ON measurements(timestamp);
CREATE INDEX IF NOT EXISTS idx_measurements_sensor_time
    ON measurements(sensor_id, timestamp);

CREATE TABLE IF NOT EXISTS alerts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    sensor_id   TEXT,
    rig_id      TEXT,
    level       TEXT NOT NULL,
    code        TEXT NOT NULL,
    message     TEXT NOT NULL,
    ack         INTEGER NOT NULL DEFAULT 0,
    ack_at      INTEGER,
    ack_reason  TEXT
);
CREATE INDEX IF NOT EXISTS idx_alerts_ack ON alerts(ack);
CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp);
";

/// Handle to the gateway database. Cheap to clone; clones share one
/// connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns an error when schema creation fails.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Insert or update a device row. Conflicts on unit id update every
    /// non-key field.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn upsert_device(&self, device: &Device) -> StoreResult<()> {
        let caps_json = caps_to_json(device.capabilities);
        self.conn()?.execute(
            "INSERT INTO devices (unit_id, alias, caps_json, rig_id, vendor_code, product_code,
                                  vendor_name, product_name, hw_version, fw_version, last_seen,
                                  poll_interval_override)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(unit_id) DO UPDATE SET
                 alias = excluded.alias,
                 caps_json = excluded.caps_json,
                 rig_id = excluded.rig_id,
                 vendor_code = excluded.vendor_code,
                 product_code = excluded.product_code,
                 vendor_name = excluded.vendor_name,
                 product_name = excluded.product_name,
                 hw_version = excluded.hw_version,
                 fw_version = excluded.fw_version,
                 last_seen = excluded.last_seen,
                 poll_interval_override = excluded.poll_interval_override",
            params![
                device.unit_id,
                device.alias,
                caps_json,
                device.display_name(),
                device.vendor_code,
                device.product_code,
                device.vendor_name,
                device.product_name,
                device.hw_version,
                device.fw_version,
                device.last_seen.map(|t| t.timestamp_millis()),
                device.poll_interval_override,
            ],
        )?;
        Ok(())
    }

    /// All persisted devices.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub fn get_devices(&self) -> StoreResult<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT unit_id, alias, caps_json, vendor_code, product_code, vendor_name,
                    product_name, hw_version, fw_version, last_seen, poll_interval_override
             FROM devices ORDER BY unit_id",
        )?;
        let rows = stmt.query_map([], device_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// One persisted device.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_device(&self, unit_id: u8) -> StoreResult<Option<Device>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT unit_id, alias, caps_json, vendor_code, product_code, vendor_name,
                    product_name, hw_version, fw_version, last_seen, poll_interval_override
             FROM devices WHERE unit_id = ?1",
            params![unit_id],
            device_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Re-key a device after a unit id change on the slave.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn rekey_device(&self, old_unit_id: u8, new_unit_id: u8) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE devices SET unit_id = ?2 WHERE unit_id = ?1",
            params![old_unit_id, new_unit_id],
        )?;
        Ok(())
    }

    /// Update a device's last-seen timestamp after a successful poll.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn touch_device(&self, unit_id: u8, seen: DateTime<Utc>) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE devices SET last_seen = ?2 WHERE unit_id = ?1",
            params![unit_id, seen.timestamp_millis()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sensors
    // ------------------------------------------------------------------

    /// Insert or update a sensor row. On conflict the identity fields are
    /// refreshed; alarm thresholds are operator state and survive
    /// rediscovery untouched.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn upsert_sensor(&self, sensor: &Sensor) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO sensors (sensor_id, unit_id, type, unit, register,
                                  alarm_lo, alarm_hi, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(sensor_id) DO UPDATE SET
                 unit_id = excluded.unit_id,
                 type = excluded.type,
                 unit = excluded.unit,
                 register = excluded.register",
            params![
                sensor.sensor_id,
                sensor.unit_id,
                sensor.kind.as_str(),
                sensor.unit,
                sensor.register,
                sensor.alarm_lo,
                sensor.alarm_hi,
                sensor.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Sensors belonging to a device.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub fn get_sensors(&self, unit_id: u8) -> StoreResult<Vec<Sensor>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sensor_id, unit_id, type, unit, register, alarm_lo, alarm_hi, created_at
             FROM sensors WHERE unit_id = ?1 ORDER BY sensor_id",
        )?;
        let rows = stmt.query_map(params![unit_id], sensor_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// One sensor by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_sensor(&self, sensor_id: &str) -> StoreResult<Option<Sensor>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT sensor_id, unit_id, type, unit, register, alarm_lo, alarm_hi, created_at
             FROM sensors WHERE sensor_id = ?1",
            params![sensor_id],
            sensor_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Alarm thresholds for a sensor, `(lo, hi)`, when the sensor exists.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn sensor_thresholds(
        &self,
        sensor_id: &str,
    ) -> StoreResult<Option<(Option<f64>, Option<f64>)>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT alarm_lo, alarm_hi FROM sensors WHERE sensor_id = ?1",
            params![sensor_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Measurements
    // ------------------------------------------------------------------

    /// Append one measurement, committed immediately. Returns the row id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn insert_measurement(
        &self,
        timestamp: DateTime<Utc>,
        value: &SensorValue,
    ) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO measurements (timestamp, sensor_id, type, value, unit, quality)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                timestamp.timestamp_millis(),
                value.sensor_id,
                value.kind.as_str(),
                value.value,
                value.unit,
                value.quality.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Time-range query over one sensor, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub fn get_measurements(
        &self,
        sensor_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<Measurement>> {
        let since_ms = since.map_or(i64::MIN, |t| t.timestamp_millis());
        let until_ms = until.map_or(i64::MAX, |t| t.timestamp_millis());
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, sensor_id, type, value, unit, quality, sent_to_cloud
             FROM measurements
             WHERE sensor_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![sensor_id, since_ms, until_ms, limit as i64],
            measurement_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Oldest measurements not yet published to the cloud.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub fn get_unsent_measurements(&self, limit: usize) -> StoreResult<Vec<Measurement>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, sensor_id, type, value, unit, quality, sent_to_cloud
             FROM measurements WHERE sent_to_cloud = 0
             ORDER BY timestamp ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], measurement_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Flag measurement rows as published.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn mark_sent(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare("UPDATE measurements SET sent_to_cloud = 1 WHERE id = ?1")?;
        for id in ids {
            stmt.execute(params![id])?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Create an alert row and return it with its id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn insert_alert(
        &self,
        timestamp: DateTime<Utc>,
        sensor_id: Option<&str>,
        rig_id: Option<&str>,
        level: AlertLevel,
        code: AlertCode,
        message: &str,
    ) -> StoreResult<Alert> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alerts (timestamp, sensor_id, rig_id, level, code, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                timestamp.timestamp_millis(),
                sensor_id,
                rig_id,
                level.as_str(),
                code.as_str(),
                message,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Alert {
            id,
            timestamp,
            sensor_id: sensor_id.map(str::to_string),
            rig_id: rig_id.map(str::to_string),
            level,
            code,
            message: message.to_string(),
            ack: false,
            ack_at: None,
            ack_reason: None,
        })
    }

    /// Query alerts, optionally filtered by acknowledged flag and level,
    /// newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub fn get_alerts(
        &self,
        ack: Option<bool>,
        level: Option<AlertLevel>,
        limit: usize,
    ) -> StoreResult<Vec<Alert>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, sensor_id, rig_id, level, code, message, ack, ack_at, ack_reason
             FROM alerts
             WHERE (?1 IS NULL OR ack = ?1) AND (?2 IS NULL OR level = ?2)
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                ack.map(i64::from),
                level.map(AlertLevel::as_str),
                limit as i64
            ],
            alert_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// One alert by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn get_alert(&self, id: i64) -> StoreResult<Option<Alert>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, timestamp, sensor_id, rig_id, level, code, message, ack, ack_at, ack_reason
             FROM alerts WHERE id = ?1",
            params![id],
            alert_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All unacknowledged alerts (active set rebuild at startup).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    pub fn get_active_alerts(&self) -> StoreResult<Vec<Alert>> {
        self.get_alerts(Some(false), None, 100_000)
    }

    /// Acknowledge an alert. Acknowledgement is monotonic: a second call
    /// returns the row unchanged. Returns `None` when the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn acknowledge_alert(&self, id: i64, reason: &str) -> StoreResult<Option<Alert>> {
        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE alerts SET ack = 1, ack_at = ?2, ack_reason = ?3
                 WHERE id = ?1 AND ack = 0",
                params![id, Utc::now().timestamp_millis(), reason],
            )?;
        }
        self.get_alert(id)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Delete measurements older than `days`. Alerts are retained.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn cleanup_older_than(&self, days: u32) -> StoreResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - i64::from(days) * 86_400_000;
        let deleted = self.conn()?.execute(
            "DELETE FROM measurements WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            debug!(deleted, days, "retention cleanup");
        }
        Ok(deleted)
    }

    /// Aggregate counts and database size.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<u64, rusqlite::Error> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        };
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(StoreStats {
            devices: count("SELECT COUNT(*) FROM devices")?,
            sensors: count("SELECT COUNT(*) FROM sensors")?,
            measurements: count("SELECT COUNT(*) FROM measurements")?,
            alerts: count("SELECT COUNT(*) FROM alerts")?,
            active_alerts: count("SELECT COUNT(*) FROM alerts WHERE ack = 0")?,
            db_size_bytes: (page_count * page_size) as u64,
        })
    }
}

fn caps_to_json(caps: Capabilities) -> String {
    serde_json::json!({ "mask": caps.0, "names": caps.names() }).to_string()
}

fn caps_from_json(raw: &str) -> Capabilities {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("mask").and_then(serde_json::Value::as_u64))
        .map_or(Capabilities::default(), |mask| Capabilities(mask as u16))
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn device_from_row(row: &Row<'_>) -> Result<Device, rusqlite::Error> {
    let caps_json: String = row.get(2)?;
    let last_seen: Option<i64> = row.get(9)?;
    let mut device = Device::new(row.get(0)?);
    device.alias = row.get(1)?;
    device.capabilities = caps_from_json(&caps_json);
    device.vendor_code = row.get(3)?;
    device.product_code = row.get(4)?;
    device.vendor_name = row.get(5)?;
    device.product_name = row.get(6)?;
    device.hw_version = row.get(7)?;
    device.fw_version = row.get(8)?;
    device.last_seen = last_seen.map(millis_to_utc);
    device.poll_interval_override = row.get(10)?;
    Ok(device)
}

fn sensor_from_row(row: &Row<'_>) -> Result<Sensor, rusqlite::Error> {
    let kind_str: String = row.get(2)?;
    let kind = SensorKind::from_str_opt(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown sensor type {kind_str}").into(),
        )
    })?;
    Ok(Sensor {
        sensor_id: row.get(0)?,
        unit_id: row.get(1)?,
        kind,
        unit: row.get(3)?,
        register: row.get(4)?,
        alarm_lo: row.get(5)?,
        alarm_hi: row.get(6)?,
        created_at: millis_to_utc(row.get(7)?),
    })
}

fn measurement_from_row(row: &Row<'_>) -> Result<Measurement, rusqlite::Error> {
    let kind_str: String = row.get(3)?;
    let quality_str: String = row.get(6)?;
    Ok(Measurement {
        id: row.get(0)?,
        timestamp: millis_to_utc(row.get(1)?),
        sensor_id: row.get(2)?,
        kind: SensorKind::from_str_opt(&kind_str).unwrap_or(SensorKind::TiltX),
        value: row.get(4)?,
        unit: row.get(5)?,
        quality: Quality::from_str_opt(&quality_str).unwrap_or(Quality::ErrorComms),
        sent_to_cloud: row.get::<_, i64>(7)? != 0,
    })
}

fn alert_from_row(row: &Row<'_>) -> Result<Alert, rusqlite::Error> {
    let level_str: String = row.get(4)?;
    let code_str: String = row.get(5)?;
    let ack_at: Option<i64> = row.get(8)?;
    Ok(Alert {
        id: row.get(0)?,
        timestamp: millis_to_utc(row.get(1)?),
        sensor_id: row.get(2)?,
        rig_id: row.get(3)?,
        level: AlertLevel::from_str_opt(&level_str).unwrap_or(AlertLevel::Warn),
        code: AlertCode::from_str_opt(&code_str).unwrap_or(AlertCode::DeviceOffline),
        message: row.get(6)?,
        ack: row.get::<_, i64>(7)? != 0,
        ack_at: ack_at.map(millis_to_utc),
        ack_reason: row.get(9)?,
    })
}
