//! Prometheus metrics for gateway monitoring.
//!
//! Exposes bus, device, storage, and alert gauges in Prometheus text
//! format at `/metrics`. Counters owned by other subsystems (the bus
//! master, the store) are mirrored into gauges on each scrape.

use crate::state::AppContext;
use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use gateway_common::types::DeviceStatus;
use prometheus::{IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics registry and collectors.
pub struct GatewayMetrics {
    registry: Registry,

    /// Frames transmitted by the bus master.
    pub bus_tx_frames: IntGauge,
    /// Responses accepted by the bus master.
    pub bus_rx_frames_ok: IntGauge,
    /// Framing-damaged responses.
    pub bus_crc_errors: IntGauge,
    /// Timed-out transactions.
    pub bus_timeouts: IntGauge,
    /// Exception responses.
    pub bus_exceptions: IntGauge,
    /// Serial line availability (1 = open).
    pub bus_link_up: IntGauge,

    /// Devices in the cache.
    pub devices_total: IntGauge,
    /// Devices currently online.
    pub devices_online: IntGauge,

    /// Measurement rows persisted.
    pub measurements_total: IntGauge,
    /// Unacknowledged alert rows.
    pub active_alerts: IntGauge,

    /// Connected WebSocket clients.
    pub ws_clients: IntGauge,
}

impl GatewayMetrics {
    /// Create a new metrics instance with its own registry.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| {
            IntGauge::new(name, help).expect("metric creation should succeed")
        };

        let bus_tx_frames = gauge("gateway_bus_tx_frames", "Frames transmitted on the bus");
        let bus_rx_frames_ok = gauge("gateway_bus_rx_frames_ok", "Responses accepted");
        let bus_crc_errors = gauge("gateway_bus_crc_errors", "Framing-damaged responses");
        let bus_timeouts = gauge("gateway_bus_timeouts", "Timed-out transactions");
        let bus_exceptions = gauge("gateway_bus_exceptions", "Modbus exception responses");
        let bus_link_up = gauge("gateway_bus_link_up", "Serial line availability (1 = open)");
        let devices_total = gauge("gateway_devices_total", "Devices in the cache");
        let devices_online = gauge("gateway_devices_online", "Devices currently online");
        let measurements_total =
            gauge("gateway_measurements_total", "Measurement rows persisted");
        let active_alerts = gauge("gateway_active_alerts", "Unacknowledged alert rows");
        let ws_clients = gauge(
            "gateway_websocket_clients",
            "Number of connected WebSocket clients",
        );

        for collector in [
            &bus_tx_frames,
            &bus_rx_frames_ok,
            &bus_crc_errors,
            &bus_timeouts,
            &bus_exceptions,
            &bus_link_up,
            &devices_total,
            &devices_online,
            &measurements_total,
            &active_alerts,
            &ws_clients,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("registration should succeed");
        }

        Self {
            registry,
            bus_tx_frames,
            bus_rx_frames_ok,
            bus_crc_errors,
            bus_timeouts,
            bus_exceptions,
            bus_link_up,
            devices_total,
            devices_online,
            measurements_total,
            active_alerts,
            ws_clients,
        }
    }

    /// Mirror subsystem counters into the gauges.
    pub fn refresh(&self, ctx: &AppContext) {
        let stats = ctx.manager.bus().stats();
        self.bus_tx_frames.set(stats.tx_frames as i64);
        self.bus_rx_frames_ok.set(stats.rx_frames_ok as i64);
        self.bus_crc_errors.set(stats.crc_errors as i64);
        self.bus_timeouts.set(stats.timeouts as i64);
        self.bus_exceptions.set(stats.exceptions as i64);
        self.bus_link_up
            .set(i64::from(ctx.manager.bus().link_up()));

        let devices = ctx.manager.registry().snapshot();
        self.devices_total.set(devices.len() as i64);
        self.devices_online.set(
            devices
                .iter()
                .filter(|d| d.status == DeviceStatus::Online)
                .count() as i64,
        );

        if let Ok(stats) = ctx.store.stats() {
            self.measurements_total.set(stats.measurements as i64);
            self.active_alerts.set(stats.active_alerts as i64);
        }
    }

    /// Render metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding fails.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families)
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics endpoint handler.
///
/// GET /metrics
pub async fn metrics_handler(Extension(ctx): Extension<Arc<AppContext>>) -> impl IntoResponse {
    ctx.metrics.refresh(&ctx);
    match ctx.metrics.render() {
        Ok(output) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation_and_render() {
        let metrics = GatewayMetrics::new();
        metrics.ws_clients.inc();
        metrics.bus_tx_frames.set(42);

        let output = metrics.render().expect("should render");
        assert!(output.contains("gateway_websocket_clients 1"));
        assert!(output.contains("gateway_bus_tx_frames 42"));
    }
}
