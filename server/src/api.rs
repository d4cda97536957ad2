//! Route table, request decoding and error mapping.
//!
//! Uploads arrive as multipart form files (signature text, policy
//! formula, event batches), matching the original operator tooling.
//! Every handler locks the shared [`Monitor`], so ingest and policy
//! changes are mutually exclusive by construction.
//!
//! [`Monitor`]: monitord_core::Monitor

use std::sync::Arc;

use axum::Router;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use monitord_core::engine::supervisor::{EngineState, StopOutcome};
use monitord_core::planner::PolicyChangeRequest;
use monitord_core::{Monitor, MonitorError};
use monitord_protocol::RawEventDocument;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Mutex<Monitor>>,
}

impl AppState {
    pub fn new(monitor: Monitor) -> Self {
        Self {
            monitor: Arc::new(Mutex::new(monitor)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/get-signature", get(get_signature))
        .route("/set-signature", post(set_signature))
        .route("/get-policy", get(get_policy))
        .route("/set-policy", post(set_policy))
        .route("/change-policy", post(change_policy))
        .route("/log-events", post(log_events))
        .route("/get-events", get(get_events))
        .route("/start-monitor", get(start_monitor).post(start_monitor))
        .route("/stop-monitor", get(stop_monitor).post(stop_monitor))
        .route("/reset-everything", get(reset_everything))
        .route("/engine-log", get(engine_log))
        .with_state(state)
}

pub enum ApiError {
    Monitor(MonitorError),
    BadRequest(String),
}

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        ApiError::Monitor(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, json!({ "error": msg }))
            }
            ApiError::Monitor(err) => match err {
                MonitorError::RetryLater { observed, expected } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({
                        "error": err.to_string(),
                        "observed": observed,
                        "expected": expected,
                        "retry": true,
                    }),
                ),
                MonitorError::NotMonitorable { ref diagnostic } => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    json!({ "error": "policy rejected", "diagnostic": diagnostic }),
                ),
                MonitorError::NotConfigured { .. }
                | MonitorError::EngineNotRunning
                | MonitorError::SignatureBound
                | MonitorError::PolicyBound => {
                    (StatusCode::CONFLICT, json!({ "error": err.to_string() }))
                }
                MonitorError::InvalidEvents(_) | MonitorError::Signature(_) => {
                    (StatusCode::BAD_REQUEST, json!({ "error": err.to_string() }))
                }
                MonitorError::Store(_) | MonitorError::BrokenPipe(_) => {
                    (StatusCode::BAD_GATEWAY, json!({ "error": err.to_string() }))
                }
                MonitorError::CutoverFailed(_) => {
                    error!(%err, "fatal error surfaced to client");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({ "error": err.to_string(), "fatal": true }),
                    )
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": err.to_string() }),
                ),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Drain a multipart upload into (name, text) pairs.
async fn collect_fields(
    mut multipart: Multipart,
) -> Result<std::collections::HashMap<String, String>, ApiError> {
    let mut fields = std::collections::HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let text = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        fields.insert(name, text);
    }
    Ok(fields)
}

fn require<'a>(
    fields: &'a std::collections::HashMap<String, String>,
    name: &str,
) -> Result<&'a str, ApiError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ApiError::BadRequest(format!("missing multipart field `{name}`")))
}

fn flag(fields: &std::collections::HashMap<String, String>, name: &str) -> bool {
    fields
        .get(name)
        .is_some_and(|v| matches!(v.trim(), "true" | "1" | "yes"))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.lock().await.status())
}

async fn get_signature(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let text = state.monitor.lock().await.signature_text().await?;
    Ok(Json(json!({ "signature": text })))
}

async fn set_signature(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let fields = collect_fields(multipart).await?;
    let text = require(&fields, "signature")?;
    state.monitor.lock().await.set_signature(text).await?;
    Ok(Json(json!({ "status": "signature bound" })))
}

async fn get_policy(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let policy = state.monitor.lock().await.policy().await?;
    Ok(Json(json!({ "policy": policy.formula, "negate": policy.negate })))
}

async fn set_policy(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let fields = collect_fields(multipart).await?;
    let formula = require(&fields, "policy")?;
    let negate = flag(&fields, "negate");
    state
        .monitor
        .lock()
        .await
        .set_policy(formula, negate)
        .await?;
    Ok(Json(json!({ "status": "policy set", "negate": negate })))
}

async fn change_policy(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let fields = collect_fields(multipart).await?;
    let request = PolicyChangeRequest {
        formula: require(&fields, "policy")?.to_string(),
        negate: flag(&fields, "negate"),
        naive: flag(&fields, "naive"),
    };
    let report = state.monitor.lock().await.change_policy(request).await?;
    Ok(Json(json!({ "status": "policy changed", "report": report })))
}

async fn log_events(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let fields = collect_fields(multipart).await?;
    let raw = require(&fields, "events")?;
    let document: RawEventDocument = serde_json::from_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("events payload is not valid JSON: {e}")))?;
    let report = state
        .monitor
        .lock()
        .await
        .ingest(document.into_events())
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    start: Option<String>,
    end: Option<String>,
}

async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let parse = |raw: Option<&str>, which: &str| match raw {
        None => Ok(None),
        Some(raw) => monitord_core::codec::parse_timestamp(raw)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("unparseable `{which}` timestamp"))),
    };
    let start = parse(query.start.as_deref(), "start")?;
    let end = parse(query.end.as_deref(), "end")?;
    let events = state.monitor.lock().await.events_between(start, end).await?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    resume: Option<bool>,
}

async fn start_monitor(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = state
        .monitor
        .lock()
        .await
        .start(query.resume.unwrap_or(false))
        .await?;
    let engine = match engine {
        EngineState::Running => "running",
        EngineState::Draining => "draining",
        EngineState::Stopped { .. } => "stopped",
    };
    Ok(Json(json!({ "engine": engine })))
}

#[derive(Debug, Deserialize)]
struct StopQuery {
    save: Option<bool>,
}

async fn stop_monitor(
    State(state): State<AppState>,
    Query(query): Query<StopQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .monitor
        .lock()
        .await
        .stop(query.save.unwrap_or(true))
        .await?;
    let outcome = match outcome {
        StopOutcome::Saved => "saved",
        StopOutcome::Killed => "killed",
        StopOutcome::NotRunning => "not-running",
    };
    Ok(Json(json!({ "stopped": outcome })))
}

async fn reset_everything(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    state.monitor.lock().await.reset().await?;
    Ok(Json(json!({ "status": "reset" })))
}

async fn engine_log(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let log = state.monitor.lock().await.engine_log(200).await?;
    Ok(Json(json!({ "log": log })))
}
