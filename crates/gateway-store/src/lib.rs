//! Local durable store for devices, sensors, measurements, and alerts.
//!
//! One SQLite database file holds everything. The schema is created
//! idempotently on open. Writers serialize on a connection mutex, which is
//! the standard SQLite discipline; readers share the same connection.

mod store;

pub use store::{Store, StoreError, StoreResult, StoreStats};
