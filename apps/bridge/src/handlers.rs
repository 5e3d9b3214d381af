//! The cloud-shaped HTTP surface. Paths and field names must match the
//! vendor endpoints exactly; unmodified firmware calls these verbatim.
//!
//! Error policy is deliberate leniency: the firmware does not handle HTTP
//! errors gracefully, so a malformed or absent body still gets a success
//! envelope (with placeholder identifiers where needed). The goal is
//! device-side progress at any cost; real errors belong to the operator
//! tools, not this boundary.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{Method, Uri},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::registry::{DeviceStatus, RegistrationFields, Registry};
use crate::request_log::{LogEntry, RequestLog};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub log: Arc<RequestLog>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/life2/device/accessCloud.json",
            post(access_cloud).get(access_cloud),
        )
        .route("/jbalancer/new/bimqtt", get(broker_info).post(broker_info))
        .route("/life2/server/getServerInfo.json", post(server_info))
        .route("/user/app/customer/v2/AuthenCross.json", post(authen_cross))
        .route(
            "/user/app/customer/isSessionTimeout.json",
            post(session_timeout),
        )
        .route("/life2/device/list.json", post(device_list))
        .route("/api/status", get(bridge_status))
        .route("/api/bulbs", get(list_bulbs))
        .fallback(catch_all)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct AccessCloudResponse {
    pub info: &'static str,
    #[serde(rename = "jsessionId")]
    pub jsession_id: String,
    #[serde(rename = "deviceUuid")]
    pub device_uuid: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "productCode")]
    pub product_code: String,
    #[serde(rename = "typeCode")]
    pub type_code: String,
    pub status: &'static str,
    pub timestamp: i64,
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

/// POST /life2/device/accessCloud.json - device registration.
async fn access_cloud(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<AccessCloudResponse> {
    let data = parse_body(&body);
    log_request(&state, "accessCloud", &uri, &method, remote, &data);

    // Early handshake calls sometimes omit the device id; answer with a
    // deterministic placeholder instead of an error so the firmware keeps
    // moving.
    let device_uuid = data
        .get("deviceUuid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("unknown-{}", remote.ip()));
    let user_id = data
        .get("userId")
        .and_then(Value::as_str)
        .unwrap_or(&state.config.default_user_id)
        .to_string();
    let product_code = data
        .get("productCode")
        .and_then(Value::as_str)
        .unwrap_or("wifielement")
        .to_string();
    let type_code = data
        .get("typeCode")
        .and_then(Value::as_str)
        .unwrap_or("W31-N11")
        .to_string();

    let jsession_id = generate_session_token();
    let record = state.registry.upsert(
        &device_uuid,
        RegistrationFields {
            address: Some(remote.ip()),
            session_id: Some(jsession_id.clone()),
            user_id: Some(user_id.clone()),
            product_code: Some(product_code.clone()),
            type_code: Some(type_code.clone()),
        },
    );
    info!(device = %record.device_id, ip = %remote.ip(), "rescued bulb registration");

    let now_ms = Utc::now().timestamp_millis();
    Json(AccessCloudResponse {
        info: "OK",
        jsession_id,
        device_uuid,
        user_id,
        product_code,
        type_code,
        status: "online",
        timestamp: now_ms,
        server_time: now_ms,
    })
}

#[derive(Debug, Serialize)]
pub struct BrokerInfoResponse {
    pub info: &'static str,
    #[serde(rename = "inceptionAddr")]
    pub inception_addr: String,
    pub mqtt: MqttInfo,
}

#[derive(Debug, Serialize)]
pub struct MqttInfo {
    pub host: String,
    pub port: u16,
    #[serde(rename = "wsPort")]
    pub ws_port: u16,
    pub path: &'static str,
}

/// GET|POST /jbalancer/new/bimqtt - broker discovery. Stateless: whatever
/// the request says, the answer is our own address. Nothing has to listen
/// on the advertised ports for UDP control to keep working; the firmware
/// just requires this handshake step to exist.
async fn broker_info(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<BrokerInfoResponse> {
    let data = parse_body(&body);
    log_request(&state, "bimqtt", &uri, &method, remote, &data);

    Json(BrokerInfoResponse {
        info: "OK",
        inception_addr: state.config.inception_addr(),
        mqtt: MqttInfo {
            host: state.config.advertised_addr.to_string(),
            port: state.config.mqtt_port,
            ws_port: state.config.mqtt_ws_port,
            path: "/mqtt",
        },
    })
}

/// POST /life2/server/getServerInfo.json
async fn server_info(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<Value> {
    let data = parse_body(&body);
    log_request(&state, "getServerInfo", &uri, &method, remote, &data);

    Json(json!({
        "info": "OK",
        "inceptionAddr": state.config.inception_addr(),
        "serverTime": Utc::now().timestamp_millis(),
    }))
}

/// POST /user/app/customer/v2/AuthenCross.json - always succeeds with a
/// fabricated session token.
async fn authen_cross(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<Value> {
    let data = parse_body(&body);
    log_request(&state, "AuthenCross", &uri, &method, remote, &data);

    let user_id = data
        .get("user")
        .and_then(Value::as_str)
        .unwrap_or("rescued_user");
    Json(json!({
        "jsessionId": generate_session_token(),
        "info": "OK",
        "userId": user_id,
        "timestamp": Utc::now().timestamp_millis(),
    }))
}

/// POST /user/app/customer/isSessionTimeout.json - sessions never time out
/// here; the bridge has no reason to force a re-registration.
async fn session_timeout(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<Value> {
    let data = parse_body(&body);
    log_request(&state, "isSessionTimeout", &uri, &method, remote, &data);
    Json(json!({"info": "OK", "timeout": false}))
}

/// POST /life2/device/list.json - the registry rendered in the attribute
/// shape the vendor app expects.
async fn device_list(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<Value> {
    let data = parse_body(&body);
    log_request(&state, "deviceList", &uri, &method, remote, &data);

    let devices: Vec<Value> = state
        .registry
        .list()
        .into_iter()
        .map(|record| {
            json!({
                "deviceUuid": record.device_id,
                "productCode": record.product_code,
                "typeCode": record.type_code,
                "status": vendor_status(record.status),
                "attributes": {
                    "switch": 1,
                    "brightness": 100,
                    "colorTemperature": 4000,
                },
            })
        })
        .collect();

    Json(json!({"info": "OK", "deviceList": devices}))
}

/// GET /api/status - operator diagnostics.
async fn bridge_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "filament-bridge",
        "status": "active",
        "rescued_bulbs": state.registry.len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "intercepted_requests": state.log.total(),
    }))
}

/// GET /api/bulbs - read-only registry dump.
async fn list_bulbs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"bulbs": state.registry.list()}))
}

/// Any other path, any method: log it for analysis and answer OK. Firmware
/// revisions differ in which extra endpoints they probe.
async fn catch_all(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<Value> {
    let data = parse_body(&body);
    log_request(&state, "unknown", &uri, &method, remote, &data);
    Json(json!({"info": "OK", "status": "rescued"}))
}

fn vendor_status(status: DeviceStatus) -> &'static str {
    match status {
        DeviceStatus::Active => "online",
        DeviceStatus::Pending => "pending",
        DeviceStatus::Stale => "offline",
    }
}

/// Best-effort body parse; anything unparseable is treated as empty rather
/// than rejected.
fn parse_body(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap_or_else(|_| json!({}))
}

/// 24-character opaque token of the shape the firmware is used to seeing.
/// Not cryptographically meaningful; nothing validates it later.
fn generate_session_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(24);
    token
}

fn log_request(
    state: &AppState,
    endpoint: &'static str,
    uri: &Uri,
    method: &Method,
    remote: SocketAddr,
    body: &Value,
) {
    debug!(endpoint, path = %uri.path(), ip = %remote.ip(), "intercepted request");
    state.log.append(LogEntry {
        at: Utc::now(),
        endpoint,
        path: uri.path().to_string(),
        method: method.to_string(),
        remote: remote.ip().to_string(),
        body: body.clone(),
    });
}
