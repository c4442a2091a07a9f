//! `/api/v1/queue*` — operational endpoints (spec §6) plus the
//! admin-only dead-letter inspect/replay pair (SPEC_FULL §5 supplement).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use extractor::EntityExtractor;
use provider::ProviderClient;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub notifications_pending: i64,
    pub notifications_processing: i64,
    pub notifications_dead: i64,
    pub ai_pending: i64,
    pub ai_processing: i64,
    pub ai_dead: i64,
}

pub async fn queue_stats<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(_user_id): AuthenticatedUser,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let notif = state.notifications.peek_stats().await?;
    let ai = state.ai_queue.peek_stats().await?;
    Ok(Json(QueueStatsResponse {
        notifications_pending: notif.pending,
        notifications_processing: notif.processing,
        notifications_dead: notif.dead,
        ai_pending: ai.pending,
        ai_processing: ai.processing,
        ai_dead: ai.dead,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ProcessQuery {
    pub max_items: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub notifications_handled: usize,
    pub ai_handled: usize,
}

/// Drives one manual drain pass of both queues — useful for tests and
/// operators who don't want to wait for the next scheduler tick.
pub async fn process_queues<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(_user_id): AuthenticatedUser,
    Query(query): Query<ProcessQuery>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let max_items = query.max_items.unwrap_or(50);
    let notifications_handled = state.scheduler.drain_notifications(max_items).await?;
    let ai_handled = state.scheduler.drain_ai_processing(max_items).await?;
    Ok(Json(ProcessResponse { notifications_handled, ai_handled }))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub queue: String,
    pub limit: Option<i64>,
}

pub async fn list_dead_letters<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(_user_id): AuthenticatedUser,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<store::QueueRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(50);
    let records = match query.queue.as_str() {
        "notifications" => state.notifications.list_dead_letters(limit).await?,
        "ai" => state.ai_queue.list_dead_letters(limit).await?,
        other => return Err(ApiError::BadRequest(format!("unknown queue {other}"))),
    };
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub queue: String,
}

pub async fn replay_dead_letter<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(_user_id): AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<StatusCode, ApiError> {
    match query.queue.as_str() {
        "notifications" => state.notifications.replay_dead_letter(&id).await?,
        "ai" => state.ai_queue.replay_dead_letter(&id).await?,
        other => return Err(ApiError::BadRequest(format!("unknown queue {other}"))),
    }
    Ok(StatusCode::NO_CONTENT)
}
