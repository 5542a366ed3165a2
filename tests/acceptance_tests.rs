//! Acceptance tests for the rig sensor gateway.
//!
//! These drive the full in-process stack - bus master, device manager,
//! polling worker, alert engine, and event bus - against a simulated
//! slave bank implementing the published register map:
//! - Discovery and re-discovery of a multi-drop bus
//! - Alias write round-trips down to the wire layout
//! - Threshold alerts with automatic resolution
//! - Offline deadlines and recovery
//! - Operator commands interleaved with a running polling loop

mod acceptance;
