//! REST API handlers.

use crate::state::AppContext;
use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use gateway_common::error::GatewayError;
use gateway_common::events::GatewayEvent;
use gateway_common::types::{Alert, AlertLevel, Device, Measurement, Sensor};
use gateway_device::PollerStatus;
use gateway_modbus::BusStatsSnapshot;
use gateway_store::StoreStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Structured error object returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    /// Human-readable message.
    pub error: String,
    /// HTTP status code.
    pub code: u16,
}

impl ApiError {
    fn new(code: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let status = match &e {
            GatewayError::Validation(_) | GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::DeviceNotFound(_) | GatewayError::AlertNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Bus(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Storage(_) | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /api/health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Serial adapter state and master counters.
#[derive(Serialize)]
pub struct AdapterResponse {
    pub port: String,
    pub baudrate: u32,
    pub status: &'static str,
    pub stats: BusStatsSnapshot,
}

/// GET /api/adapter
pub async fn adapter(Extension(ctx): Extension<Arc<AppContext>>) -> Json<AdapterResponse> {
    let bus = ctx.manager.bus();
    Json(AdapterResponse {
        port: bus.descriptor().to_string(),
        baudrate: bus.baud(),
        status: if bus.link_up() { "open" } else { "closed" },
        stats: bus.stats(),
    })
}

/// GET /api/devices
pub async fn devices(Extension(ctx): Extension<Arc<AppContext>>) -> Json<Vec<Device>> {
    Json(ctx.manager.registry().snapshot())
}

/// Discovery request body.
#[derive(Deserialize)]
pub struct DiscoverRequest {
    #[serde(alias = "unitIdMin")]
    pub unit_id_min: u8,
    #[serde(alias = "unitIdMax")]
    pub unit_id_max: u8,
}

/// POST /api/discover
pub async fn discover(
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(req): Json<DiscoverRequest>,
) -> ApiResult<Vec<Device>> {
    let found = ctx
        .manager
        .discover(req.unit_id_min..=req.unit_id_max)
        .await?;
    Ok(Json(found))
}

/// Identify request body.
#[derive(Deserialize)]
pub struct IdentifyRequest {
    #[serde(alias = "durationSec", default = "default_identify_secs")]
    pub duration_sec: u16,
}

fn default_identify_secs() -> u16 {
    5
}

/// POST /api/devices/{unitId}/identify
pub async fn identify(
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(unit_id): Path<u8>,
    Json(req): Json<IdentifyRequest>,
) -> ApiResult<serde_json::Value> {
    ctx.manager.identify(unit_id, req.duration_sec).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Alias request body.
#[derive(Deserialize)]
pub struct AliasRequest {
    pub alias: String,
}

/// PUT /api/devices/{unitId}/alias
pub async fn set_alias(
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(unit_id): Path<u8>,
    Json(req): Json<AliasRequest>,
) -> ApiResult<Device> {
    ctx.manager.set_alias(unit_id, &req.alias).await?;
    let device = ctx
        .manager
        .registry()
        .get(unit_id)
        .ok_or(GatewayError::DeviceNotFound(unit_id))?;
    Ok(Json(device))
}

/// Unit id change request body.
#[derive(Deserialize)]
pub struct UnitIdRequest {
    #[serde(alias = "newUnitId")]
    pub new_unit_id: u8,
}

/// PUT /api/devices/{unitId}/unit_id
pub async fn set_unit_id(
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(unit_id): Path<u8>,
    Json(req): Json<UnitIdRequest>,
) -> ApiResult<serde_json::Value> {
    ctx.manager.set_unit_id(unit_id, req.new_unit_id).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "note": "re-run discovery to confirm the device under its new unit id",
    })))
}

/// Polling start request body.
#[derive(Deserialize, Default)]
pub struct PollingStartRequest {
    #[serde(alias = "intervalSec")]
    pub interval_sec: Option<u64>,
    #[serde(alias = "unitIds", default)]
    pub unit_ids: Vec<u8>,
}

/// POST /api/polling/start
///
/// The body is optional; omitting it polls every cached device at the
/// configured interval.
pub async fn polling_start(
    Extension(ctx): Extension<Arc<AppContext>>,
    body: Result<Json<PollingStartRequest>, JsonRejection>,
) -> ApiResult<PollerStatus> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    ctx.poller
        .start(req.unit_ids, req.interval_sec.map(Duration::from_secs))
        .await?;
    Ok(Json(ctx.poller.status().await?))
}

/// POST /api/polling/stop
pub async fn polling_stop(Extension(ctx): Extension<Arc<AppContext>>) -> ApiResult<PollerStatus> {
    ctx.poller.stop().await?;
    Ok(Json(ctx.poller.status().await?))
}

/// GET /api/polling/status
pub async fn polling_status(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> ApiResult<PollerStatus> {
    Ok(Json(ctx.poller.status().await?))
}

/// Alert list query parameters.
#[derive(Deserialize, Default)]
pub struct AlertQuery {
    pub ack: Option<bool>,
    pub level: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/alerts?ack=&level=&limit=
pub async fn alerts(
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Vec<Alert>> {
    let level = match query.level.as_deref() {
        None | Some("") => None,
        Some(s) => Some(AlertLevel::from_str_opt(s).ok_or_else(|| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("unknown level {s}"))
        })?),
    };
    let rows = ctx
        .store
        .get_alerts(query.ack, level, query.limit.unwrap_or(100))
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(Json(rows))
}

/// Acknowledge request body.
#[derive(Deserialize, Default)]
pub struct AcknowledgeRequest {
    pub reason: Option<String>,
}

/// POST /api/alerts/{id}/acknowledge
///
/// The body is optional; without a reason the acknowledgement is
/// recorded as plain "operator".
pub async fn acknowledge_alert(
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(id): Path<i64>,
    body: Result<Json<AcknowledgeRequest>, JsonRejection>,
) -> ApiResult<Alert> {
    let reason = body
        .ok()
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "operator".to_string());

    let before = ctx
        .store
        .get_alert(id)
        .map_err(|e| GatewayError::Storage(e.to_string()))?
        .ok_or(GatewayError::AlertNotFound(id))?;

    let after = ctx
        .store
        .acknowledge_alert(id, &reason)
        .map_err(|e| GatewayError::Storage(e.to_string()))?
        .ok_or(GatewayError::AlertNotFound(id))?;

    // Announce only the actual transition; re-acknowledging is a no-op.
    if !before.ack {
        ctx.events.publish(GatewayEvent::AlertAcknowledged {
            id,
            auto: false,
            reason,
        });
    }
    Ok(Json(after))
}

/// GET /api/history/devices
pub async fn history_devices(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> ApiResult<Vec<Device>> {
    let rows = ctx
        .store
        .get_devices()
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(Json(rows))
}

/// GET /api/history/sensors/{unitId}
pub async fn history_sensors(
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(unit_id): Path<u8>,
) -> ApiResult<Vec<Sensor>> {
    let rows = ctx
        .store
        .get_sensors(unit_id)
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(Json(rows))
}

/// History query parameters.
#[derive(Deserialize, Default)]
pub struct HistoryQuery {
    pub hours: Option<u32>,
    pub limit: Option<usize>,
}

/// GET /api/history/data/{sensorId}?hours=
pub async fn history_data(
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(sensor_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<Measurement>> {
    let hours = query.hours.unwrap_or(24);
    let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
    let rows = ctx
        .store
        .get_measurements(&sensor_id, Some(since), None, query.limit.unwrap_or(1000))
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(Json(rows))
}

/// GET /api/history/stats
pub async fn history_stats(Extension(ctx): Extension<Arc<AppContext>>) -> ApiResult<StoreStats> {
    let stats = ctx
        .store
        .stats()
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(Json(stats))
}
