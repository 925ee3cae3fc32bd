//! HTTP surface.
//!
//! Authentication happens upstream; the gateway forwards the acting user in
//! `x-user-id`. Client address and agent are kept for audit records.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::audit::ActorContext;
use crate::database::models::{DecisionOutcome, VerificationHistory, VerificationRecord};
use crate::database::Database;
use crate::error::VerificationError;
use crate::signals;
use crate::tasks::TaskQueue;
use crate::verification::{
    AssessmentUpdate, ReviewStateMachine, ReviewUpdate, VerificationLedger, VerificationStatus,
};

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub machine: ReviewStateMachine,
    pub ledger: VerificationLedger,
    pub tasks: TaskQueue,
    pub server_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub reviewed: bool,
}

#[derive(Debug, Deserialize)]
pub struct AssessmentRequest {
    pub assessed: bool,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub outcome: DecisionOutcome,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EntryVerificationView {
    pub records: Vec<VerificationRecord>,
    pub history: Vec<VerificationHistory>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/logbooks/:id/verification",
            put(update_review).get(verification_status),
        )
        .route("/logbooks/:id/assessment", put(update_assessment))
        .route(
            "/entries/:id/verification",
            put(record_decision).get(entry_verification),
        )
        .route(
            "/internal/signals/grant-created",
            post(signals::handle_grant_created),
        )
        .route(
            "/internal/signals/entry-updated",
            post(signals::handle_entry_updated),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

/// Client address and user agent as reported by the gateway
pub fn request_origin(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    (ip, user_agent)
}

pub fn actor_from_headers(headers: &HeaderMap) -> Result<ActorContext, VerificationError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| {
            VerificationError::ValidationError(format!("Missing {} header", USER_ID_HEADER))
        })?
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            VerificationError::ValidationError(format!("Invalid {} header", USER_ID_HEADER))
        })?;

    let (ip, user_agent) = request_origin(headers);
    Ok(ActorContext::new(user_id).with_origin(ip, user_agent))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let database = if state.db.ping().await {
        "healthy"
    } else {
        "error"
    };

    Json(serde_json::json!({
        "status": "healthy",
        "service": "logbook-verification",
        "server_id": state.server_id,
        "database": database,
        "timestamp": chrono::Utc::now()
    }))
}

async fn update_review(
    State(state): State<AppState>,
    Path(logbook_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<ReviewUpdate>, VerificationError> {
    let actor = actor_from_headers(&headers)?;
    let update = state
        .machine
        .set_review_status(&actor, logbook_id, request.reviewed)
        .await?;
    Ok(Json(update))
}

async fn verification_status(
    State(state): State<AppState>,
    Path(logbook_id): Path<i64>,
) -> Result<Json<VerificationStatus>, VerificationError> {
    Ok(Json(state.machine.get_status(logbook_id).await?))
}

async fn update_assessment(
    State(state): State<AppState>,
    Path(logbook_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<AssessmentRequest>,
) -> Result<Json<AssessmentUpdate>, VerificationError> {
    let actor = actor_from_headers(&headers)?;
    let update = state
        .machine
        .set_assessment(&actor, logbook_id, request.assessed)
        .await?;
    Ok(Json(update))
}

async fn record_decision(
    State(state): State<AppState>,
    Path(entry_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<VerificationRecord>, VerificationError> {
    let actor = actor_from_headers(&headers)?;
    let record = state
        .ledger
        .record_decision(&actor, entry_id, request.outcome, request.notes)
        .await?;
    Ok(Json(record))
}

async fn entry_verification(
    State(state): State<AppState>,
    Path(entry_id): Path<i64>,
) -> Result<Json<EntryVerificationView>, VerificationError> {
    let records = state.ledger.records_for_entry(entry_id).await?;
    let history = state.ledger.history_for_entry(entry_id).await?;
    Ok(Json(EntryVerificationView { records, history }))
}
