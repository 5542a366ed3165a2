//! Route-level integration tests.
//!
//! Every request is dispatched through the real router built by
//! `WebServer::build_router`, over the full in-process stack: bus master
//! on a simulated slave bank, device manager, polling worker, store, and
//! event bus. Assertions cover status codes and body shape per route
//! group.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use gateway_common::events::EventBus;
use gateway_common::types::{AlertCode, AlertLevel, Capabilities, Quality, SensorKind, SensorValue};
use gateway_device::manager::{DeviceManager, DeviceManagerConfig};
use gateway_device::poller::{spawn_poller, PollerConfig};
use gateway_device::registry::DeviceRegistry;
use gateway_modbus::registers::holding;
use gateway_modbus::sim::{SimLink, SimSlave};
use gateway_modbus::{spawn_master, MasterConfig};
use gateway_store::Store;
use gateway_web::{AppContext, GatewayMetrics, WebConfig, WebServer};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tower::ServiceExt;

// ============================================================================
// Test Helpers
// ============================================================================

const MPU_CAPS: u16 = Capabilities::RS485 | Capabilities::MPU6050 | Capabilities::IDENTIFY;
const FULL_CAPS: u16 = MPU_CAPS | Capabilities::WIND | Capabilities::LOAD;

struct Harness {
    router: Router,
    store: Store,
    slaves: Arc<Mutex<Vec<SimSlave>>>,
    _shutdown: watch::Sender<bool>,
}

fn build(units: &[(u8, u16)]) -> Harness {
    let link = SimLink::default();
    for &(unit_id, caps) in units {
        link.add_slave(SimSlave::new(unit_id, caps));
    }
    let slaves = link.slaves();
    let (bus, _bus_join) = spawn_master(link, MasterConfig::default());

    let store = Store::open_in_memory().expect("store");
    let registry = Arc::new(DeviceRegistry::new());
    let events = EventBus::default();
    let manager = DeviceManager::new(
        bus,
        registry,
        store.clone(),
        events.clone(),
        DeviceManagerConfig {
            request_timeout: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(20),
            probe_retries: 1,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (alert_tx, mut alert_rx) = mpsc::channel(64);
    // Drain the alert stream so the poller never blocks on it.
    tokio::spawn(async move { while alert_rx.recv().await.is_some() {} });

    let (poller, _poller_join) = spawn_poller(
        manager.clone(),
        store.clone(),
        events.clone(),
        alert_tx,
        PollerConfig {
            interval: Duration::from_millis(25),
            inter_frame_delay: Duration::from_millis(1),
            request_timeout: Duration::from_millis(50),
        },
        shutdown_rx,
    );

    let context = Arc::new(AppContext {
        manager,
        poller,
        store: store.clone(),
        events,
        metrics: Arc::new(GatewayMetrics::new()),
    });
    let router = WebServer::new(WebConfig::default(), context).build_router();

    Harness {
        router,
        store,
        slaves,
        _shutdown: shutdown_tx,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn with_json(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn discover(harness: &Harness) {
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::POST,
            "/api/discover",
            &json!({"unitIdMin": 1, "unitIdMax": 20}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_array());
}

// ============================================================================
// Health and adapter
// ============================================================================

#[tokio::test]
async fn test_health_and_adapter() {
    let harness = build(&[(2, MPU_CAPS)]);

    let (status, body) = send(&harness.router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());

    let (status, body) = send(&harness.router, get("/api/adapter")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["port"], "sim://rs485");
    assert_eq!(body["baudrate"], 115_200);
    assert_eq!(body["status"], "open");
    assert!(body["stats"]["tx_frames"].is_u64());
}

// ============================================================================
// Discovery and devices
// ============================================================================

#[tokio::test]
async fn test_discover_then_devices() {
    let harness = build(&[(2, MPU_CAPS), (16, FULL_CAPS)]);

    let (status, body) = send(
        &harness.router,
        with_json(
            Method::POST,
            "/api/discover",
            &json!({"unitIdMin": 1, "unitIdMax": 20}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let found = body.as_array().expect("array");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["unit_id"], 2);
    assert_eq!(found[1]["unit_id"], 16);

    let (status, body) = send(&harness.router, get("/api/devices")).await;
    assert_eq!(status, StatusCode::OK);
    let devices = body.as_array().expect("array");
    assert_eq!(devices.len(), 2);
    assert_ne!(devices[0]["vendor_code"], 0);
    assert_eq!(devices[0]["status"], "online");

    // An inverted range is rejected with a structured error.
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::POST,
            "/api/discover",
            &json!({"unitIdMin": 20, "unitIdMax": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_device_commands() {
    let harness = build(&[(2, MPU_CAPS), (16, MPU_CAPS)]);
    discover(&harness).await;

    // Identify writes the duration register on the slave.
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::POST,
            "/api/devices/2/identify",
            &json!({"durationSec": 5}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    {
        let slaves = harness.slaves.lock().expect("slaves lock");
        assert_eq!(slaves[0].holding(holding::IDENTIFY_SECONDS), 5);
    }

    // Unknown devices are a 404.
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::POST,
            "/api/devices/42/identify",
            &json!({"durationSec": 5}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);

    // Alias round-trips through the cache and comes back in the body.
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::PUT,
            "/api/devices/2/alias",
            &json!({"alias": "Sensor-A"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alias"], "Sensor-A");

    // Invalid aliases are rejected before touching the bus.
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::PUT,
            "/api/devices/2/alias",
            &json!({"alias": "x".repeat(65)}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    // A unit id already on the bus is a validation error.
    let (status, _) = send(
        &harness.router,
        with_json(
            Method::PUT,
            "/api/devices/2/unit_id",
            &json!({"newUnitId": 16}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A free unit id goes through and re-keys the device.
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::PUT,
            "/api/devices/2/unit_id",
            &json!({"newUnitId": 9}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (_, body) = send(&harness.router, get("/api/devices")).await;
    let ids: Vec<u64> = body
        .as_array()
        .expect("array")
        .iter()
        .map(|d| d["unit_id"].as_u64().expect("unit id"))
        .collect();
    assert_eq!(ids, vec![9, 16]);
}

// ============================================================================
// Polling control
// ============================================================================

#[tokio::test]
async fn test_polling_lifecycle() {
    let harness = build(&[(2, MPU_CAPS)]);
    discover(&harness).await;

    let (status, body) = send(
        &harness.router,
        with_json(
            Method::POST,
            "/api/polling/start",
            &json!({"intervalSec": 1, "unitIds": [2]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["interval_sec"], 1);
    assert_eq!(body["unit_ids"], json!([2]));

    let (status, body) = send(&harness.router, get("/api/polling/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);

    let (status, body) = send(&harness.router, post_empty("/api/polling/stop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);

    // Starting without a body selects every cached device.
    let (status, body) = send(&harness.router, post_empty("/api/polling/start")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["unit_ids"], json!([2]));
}

// ============================================================================
// Alerts
// ============================================================================

#[tokio::test]
async fn test_alerts_group() {
    let harness = build(&[(2, MPU_CAPS)]);

    let alert = harness
        .store
        .insert_alert(
            Utc::now(),
            Some("UNIT_2_TILT_X"),
            None,
            AlertLevel::Alarm,
            AlertCode::ThresholdExceededHi,
            "tilt X above threshold",
        )
        .expect("insert");

    let (status, body) = send(&harness.router, get("/api/alerts?ack=false")).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().expect("array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["code"], "THRESHOLD_EXCEEDED_HI");
    assert_eq!(rows[0]["level"], "ALARM");
    assert_eq!(rows[0]["ack"], false);

    // Unknown level filter is a 400.
    let (status, _) = send(&harness.router, get("/api/alerts?level=BOGUS")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Acknowledge with an explicit reason.
    let (status, body) = send(
        &harness.router,
        with_json(
            Method::POST,
            &format!("/api/alerts/{}/acknowledge", alert.id),
            &json!({"reason": "operator: inspected"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ack"], true);
    assert_eq!(body["ack_reason"], "operator: inspected");

    // Re-acknowledging without a body is a monotonic no-op.
    let (status, body) = send(
        &harness.router,
        post_empty(&format!("/api/alerts/{}/acknowledge", alert.id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ack_reason"], "operator: inspected");

    let (status, body) = send(&harness.router, get("/api/alerts?ack=false")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().expect("array").is_empty());

    // Unknown alert ids are a 404.
    let (status, _) = send(&harness.router, post_empty("/api/alerts/999/acknowledge")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn test_history_group() {
    let harness = build(&[(2, MPU_CAPS)]);
    discover(&harness).await;

    harness
        .store
        .insert_measurement(
            Utc::now(),
            &SensorValue {
                sensor_id: "UNIT_2_TILT_X".into(),
                kind: SensorKind::TiltX,
                value: 3.1,
                unit: "deg",
                quality: Quality::Ok,
            },
        )
        .expect("measurement");

    let (status, body) = send(&harness.router, get("/api/history/devices")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().expect("array").len(), 1);

    let (status, body) = send(&harness.router, get("/api/history/sensors/2")).await;
    assert_eq!(status, StatusCode::OK);
    let sensors = body.as_array().expect("array");
    assert_eq!(sensors.len(), 9);
    assert!(sensors.iter().any(|s| s["sensor_id"] == "UNIT_2_TILT_X"));

    let (status, body) = send(
        &harness.router,
        get("/api/history/data/UNIT_2_TILT_X?hours=1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().expect("array");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], 3.1);
    assert_eq!(rows[0]["quality"], "OK");

    // A sensor with no rows is an empty array, not an error.
    let (status, body) = send(
        &harness.router,
        get("/api/history/data/UNIT_2_GYRO_Z?hours=1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().expect("array").is_empty());

    let (status, body) = send(&harness.router, get("/api/history/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["devices"], 1);
    assert_eq!(body["sensors"], 9);
    assert_eq!(body["measurements"], 1);
}

// ============================================================================
// Metrics and WebSocket endpoint
// ============================================================================

#[tokio::test]
async fn test_metrics_endpoint() {
    let harness = build(&[(2, MPU_CAPS)]);
    discover(&harness).await;

    let response = harness
        .router
        .clone()
        .oneshot(get("/metrics"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    assert!(text.contains("gateway_bus_tx_frames"));
    assert!(text.contains("gateway_devices_total 1"));
}

#[tokio::test]
async fn test_socket_requires_upgrade() {
    let harness = build(&[(2, MPU_CAPS)]);

    // A plain GET without the upgrade handshake is rejected, which also
    // proves the route is registered.
    let (status, _) = send(&harness.router, get("/socket")).await;
    assert!(status.is_client_error(), "got {status}");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let harness = build(&[(2, MPU_CAPS)]);
    let (status, _) = send(&harness.router, get("/api/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
