//! HTTP API handlers for safepath.
//!
//! Every route answers with the same envelope:
//!
//! ```json
//! { "success": true,  "data": { ... }, "error": null }
//! { "success": false, "data": null,    "error": { "code": "NOT_FOUND", "message": "...", "retryable": false } }
//! ```
//!
//! Callers branch on `success`. Body and query rejections from axum are folded
//! into the envelope as `VALIDATION_ERROR`, so a client never has to parse a
//! plain-text axum error.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tracing::{instrument, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::model::{
    AlertsQuery, EndJourneyRequest, JourneysQuery, LimitQuery, ManualAlertRequest,
    ResumeJourneyRequest, StartJourneyRequest, TelemetryRequest,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Error detail inside a failed [`Envelope`].
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Response {
        let body = Self {
            success: true,
            data: Some(data),
            error: None,
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

/// A failed request, ready to be rendered into the envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: ErrorBody {
                code: "VALIDATION_ERROR".to_string(),
                message: message.into(),
                retryable: false,
            },
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::State(_) => StatusCode::CONFLICT,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Persistence(_) | EngineError::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::Policy(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(code = e.code(), error = %e, "Request failed");
        }

        Self {
            status,
            body: ErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.body),
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult = Result<Response, ApiError>;

/// Build the full route table over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/journeys", get(list_journeys))
        .route("/journeys/start", post(start_journey))
        .route("/journeys/resume", post(resume_journey))
        .route("/journeys/end", post(end_journey))
        .route("/journeys/telemetry", post(submit_telemetry))
        .route("/journeys/analyze-risk", post(analyze_risk))
        .route("/journeys/:id", get(get_journey))
        .route("/journeys/:id/history", get(journey_history))
        .route("/journeys/:id/audit", get(journey_audit))
        .route("/alerts", post(create_alert).get(list_alerts))
        .route("/alerts/dashboard", get(dashboard_alerts))
        .route("/alerts/dashboard/stats", get(dashboard_stats))
        .route("/alerts/:id", get(get_alert))
        .route("/alerts/:id/resolve", post(resolve_alert))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /journeys/start - Begin monitoring a journey.
///
/// `start_time` defaults to the server clock when omitted.
#[instrument(skip_all)]
pub async fn start_journey(
    State(state): State<AppState>,
    body: Result<Json<StartJourneyRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let journey = state.engine.start_journey(request).await?;
    Ok(Envelope::ok(journey))
}

/// POST /journeys/resume - Resume a paused journey.
#[instrument(skip_all)]
pub async fn resume_journey(
    State(state): State<AppState>,
    body: Result<Json<ResumeJourneyRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let ack = state.engine.resume_journey(request).await?;
    Ok(Envelope::ok(ack))
}

/// POST /journeys/end - Complete a journey. Further telemetry is refused.
#[instrument(skip_all)]
pub async fn end_journey(
    State(state): State<AppState>,
    body: Result<Json<EndJourneyRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let ack = state.engine.end_journey(request).await?;
    Ok(Envelope::ok(ack))
}

/// POST /journeys/telemetry - Submit one telemetry reading.
///
/// # Response
///
/// ```json
/// {
///     "telemetry_added": true,
///     "duplicate": false,
///     "risk_assessment": { "risk_level": "HIGH", "confidence": 0.78, ... },
///     "decision": { "action": "alert_escalation", ... },
///     "action_result": { "executed": true, "alert_id": "...", "duplicate": false }
/// }
/// ```
///
/// A resubmitted reading returns the original outcome with
/// `"duplicate": true` and no `action_result`.
#[instrument(skip_all)]
pub async fn submit_telemetry(
    State(state): State<AppState>,
    body: Result<Json<TelemetryRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let outcome = state.engine.submit_telemetry(request).await?;
    Ok(Envelope::ok(outcome))
}

/// POST /journeys/analyze-risk - Assess a reading without storing it.
#[instrument(skip_all)]
pub async fn analyze_risk(
    State(state): State<AppState>,
    body: Result<Json<TelemetryRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let assessment = state.engine.preview_risk(request).await?;
    Ok(Envelope::ok(assessment))
}

/// GET /journeys?owner_id=&limit= - Most recent journeys of an owner.
#[instrument(skip_all)]
pub async fn list_journeys(
    State(state): State<AppState>,
    query: Result<Query<JourneysQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let journeys = state
        .engine
        .list_journeys(&query.owner_id, query.limit)
        .await?;
    Ok(Envelope::ok(json!({ "journeys": journeys })))
}

#[instrument(skip(state))]
pub async fn get_journey(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let journey = state.engine.get_journey(&id).await?;
    Ok(Envelope::ok(journey))
}

/// GET /journeys/:id/history - Archived points with their assessments and
/// decisions, newest first.
#[instrument(skip(state, query))]
pub async fn journey_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let entries = state.engine.journey_history(&id, query.limit).await?;
    Ok(Envelope::ok(json!({ "entries": entries })))
}

/// GET /journeys/:id/audit - Persisted audit trail of a journey, newest first.
#[instrument(skip(state, query))]
pub async fn journey_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let entries = state.engine.audit_trail(&id, query.limit).await?;
    Ok(Envelope::ok(json!({ "entries": entries })))
}

/// POST /alerts - Raise an SOS or manual alert.
#[instrument(skip_all)]
pub async fn create_alert(
    State(state): State<AppState>,
    body: Result<Json<ManualAlertRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let alert = state.engine.create_manual_alert(request).await?;
    Ok(Envelope::ok(alert))
}

#[instrument(skip_all)]
pub async fn list_alerts(
    State(state): State<AppState>,
    query: Result<Query<AlertsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let alerts = state
        .engine
        .list_alerts(&query.journey_id, query.limit)
        .await?;
    Ok(Envelope::ok(json!({ "alerts": alerts })))
}

/// GET /alerts/dashboard - Unresolved high and critical alerts, newest first.
#[instrument(skip_all)]
pub async fn dashboard_alerts(
    State(state): State<AppState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let alerts = state.engine.dashboard_alerts(query.limit).await?;
    Ok(Envelope::ok(json!({ "alerts": alerts })))
}

/// GET /alerts/dashboard/stats - Alert counters for the dashboard.
///
/// ```json
/// {
///   "total_active_alerts": 3,
///   "critical_alerts": 1,
///   "high_alerts": 2,
///   "active_journeys": 5,
///   "resolved_alerts_24h": 4
/// }
/// ```
#[instrument(skip_all)]
pub async fn dashboard_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.engine.dashboard_stats().await?;
    Ok(Envelope::ok(stats))
}

#[instrument(skip(state))]
pub async fn get_alert(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let alert = state.engine.get_alert(&id).await?;
    Ok(Envelope::ok(alert))
}

/// POST /alerts/:id/resolve - Resolve an alert. Idempotent.
#[instrument(skip(state))]
pub async fn resolve_alert(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let alert = state.engine.resolve_alert(&id).await?;
    Ok(Envelope::ok(alert))
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> Response {
    Envelope::ok(json!({ "status": "ok" }))
}
