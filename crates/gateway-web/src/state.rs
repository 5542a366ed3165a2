//! Shared application context injected into every handler.

use crate::GatewayMetrics;
use gateway_common::events::EventBus;
use gateway_device::{DeviceManager, PollerHandle};
use gateway_store::Store;
use std::sync::Arc;

/// Everything the API surface needs, wired once at daemon startup.
pub struct AppContext {
    /// Device cache and command executor.
    pub manager: DeviceManager,
    /// Polling worker control.
    pub poller: PollerHandle,
    /// Local database.
    pub store: Store,
    /// Event bus feeding WebSocket clients.
    pub events: EventBus,
    /// Prometheus collectors.
    pub metrics: Arc<GatewayMetrics>,
}
