//! `/api/v1/scan/*` (spec §6) — the two caller-triggered scan kinds:
//! an immediate on-demand pull of recent messages, and a retroactive
//! date-range scan handed off to the scheduler's slice-based admission.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use extractor::EntityExtractor;
use provider::{ListQuery, ProviderClient};
use serde::{Deserialize, Serialize};
use types::{EventSource, MessageEvent};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OndemandQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct OndemandResponse {
    pub enqueued: usize,
}

/// Lists up to `limit` recent messages straight from the provider and
/// admits each as a high-priority notification, bypassing the normal
/// poll/push cadence (spec §6 "enqueue up to N messages for immediate
/// processing").
pub async fn scan_ondemand<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<OndemandQuery>,
) -> Result<Json<OndemandResponse>, ApiError> {
    let limit = query.limit.unwrap_or(state.scan_page_size).max(1);
    let user = state.store.get_user(user_id).await?.ok_or(ApiError::NotFound("user"))?;

    let page = state.provider.list_messages(&user, ListQuery { query: None, cursor: None, page_size: limit }).await?;

    let mut enqueued = 0;
    for message_id in page.message_ids {
        let event = MessageEvent {
            user_id,
            message_id: message_id.clone(),
            thread_id: String::new(),
            history_cursor: String::new(),
            arrival_time: Utc::now(),
            source: EventSource::Poll,
            delivery_attempt: 0,
        };
        if state.notifications.enqueue(user_id, &format!("ondemand:{message_id}"), &event, 8).await? {
            enqueued += 1;
        }
    }

    Ok(Json(OndemandResponse { enqueued }))
}

#[derive(Debug, Deserialize)]
pub struct RetroactiveScanRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub async fn scan_retroactive<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(body): Json<RetroactiveScanRequest>,
) -> Result<StatusCode, ApiError> {
    if body.start >= body.end {
        return Err(ApiError::BadRequest("start must be before end".into()));
    }
    state.scheduler.enqueue_retroactive_scan(user_id, body.start, body.end).await?;
    Ok(StatusCode::ACCEPTED)
}
