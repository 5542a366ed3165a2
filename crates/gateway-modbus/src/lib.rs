//! Modbus RTU master for the shared RS-485 bus.
//!
//! This crate provides:
//! - [`crc`] module with the Modbus CRC-16 used by every frame
//! - [`frame`] module with the RTU request/response codec
//! - [`registers`] module with the slave register map
//! - [`timing`] module with character-time and silence-window arithmetic
//! - [`RtuLink`] trait abstracting the physical line, with a
//!   [`SerialLink`] production implementation and a [`sim`] module for
//!   hardware-free operation and tests
//! - [`master`] module with the bus master actor: the single owner of the
//!   line, serializing transactions FIFO and exposing counters
//!
//! The master is the only component allowed to touch the serial handle;
//! every other worker submits a request through a [`BusHandle`] and awaits
//! the reply. Retry policy deliberately lives with the callers — discovery
//! and polling want different behavior on failure.

pub mod crc;
pub mod error;
pub mod frame;
pub mod link;
pub mod master;
pub mod registers;
pub mod sim;
pub mod timing;

pub use error::BusError;
pub use frame::{ExceptionCode, FunctionCode};
pub use link::{RtuLink, SerialLink};
pub use master::{spawn_master, BusHandle, BusStatsSnapshot, MasterConfig};
pub use sim::{SimBehavior, SimLink, SimSlave};

/// Unit id reserved for broadcast writes.
pub const BROADCAST_UNIT: u8 = 0;

/// Highest addressable unit id.
pub const MAX_UNIT_ID: u8 = 247;

/// Largest RTU frame on the wire.
pub const MAX_FRAME_LEN: usize = 256;
