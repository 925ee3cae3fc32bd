//! Internal signals from the access-control and logbook services.
//!
//! A grant-created signal for a supervisor schedules a verifier backfill; an
//! entry-updated signal schedules invalidation. Both return as soon as the
//! task is queued.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::api::{request_origin, AppState};
use crate::audit::ActorContext;
use crate::database::models::GrantRole;
use crate::database::queries::Queries;
use crate::error::VerificationError;
use crate::tasks::VerificationTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreated {
    pub user_id: i64,
    pub logbook_id: i64,
    pub role: GrantRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryUpdated {
    pub entry_id: i64,
    pub logbook_id: i64,
    pub changed_fields: Vec<String>,
    pub editor: ActorContext,
    pub edited_at: DateTime<Utc>,
}

/// Wire form of the entry-updated signal
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryUpdatedRequest {
    pub entry_id: i64,
    pub changed_fields: Vec<String>,
    pub editor_id: i64,
    pub edited_at: Option<DateTime<Utc>>,
}

/// Only supervisors verify entries, so only their grants need a backfill
pub fn grant_created_task(signal: &GrantCreated) -> Option<VerificationTask> {
    match signal.role {
        GrantRole::Supervisor => Some(VerificationTask::BackfillVerifier {
            verifier_id: signal.user_id,
            logbook_id: signal.logbook_id,
        }),
        GrantRole::Owner | GrantRole::Contributor => None,
    }
}

pub fn entry_updated_task(signal: EntryUpdated) -> VerificationTask {
    VerificationTask::InvalidateEntry(signal)
}

pub async fn handle_grant_created(
    State(state): State<AppState>,
    Json(signal): Json<GrantCreated>,
) -> Result<(StatusCode, Json<Value>), VerificationError> {
    info!(
        "Received grant-created signal: user {} is {} on logbook {}",
        signal.user_id, signal.role, signal.logbook_id
    );

    let Some(task) = grant_created_task(&signal) else {
        warn!(
            "Ignoring grant-created signal for {} role (user {}, logbook {})",
            signal.role, signal.user_id, signal.logbook_id
        );
        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({"status": "ignored"})),
        ));
    };

    let task_id = state.tasks.dispatch(task)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "queued", "taskId": task_id})),
    ))
}

pub async fn handle_entry_updated(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EntryUpdatedRequest>,
) -> Result<(StatusCode, Json<Value>), VerificationError> {
    info!(
        "Received entry-updated signal for entry {} ({} field(s))",
        request.entry_id,
        request.changed_fields.len()
    );

    let entry = Queries::get_entry(state.db.pool(), request.entry_id)
        .await?
        .ok_or_else(|| VerificationError::entry_not_found(request.entry_id))?;

    let (ip, user_agent) = request_origin(&headers);
    let signal = EntryUpdated {
        entry_id: entry.id,
        logbook_id: entry.logbook_id,
        changed_fields: request.changed_fields,
        editor: ActorContext::new(request.editor_id).with_origin(ip, user_agent),
        // The stored edit time keeps a resent signal pinned to the same edit
        edited_at: request.edited_at.unwrap_or(entry.updated_at),
    };

    let task_id = state.tasks.dispatch(entry_updated_task(signal))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "queued", "taskId": task_id})),
    ))
}
