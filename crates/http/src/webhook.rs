//! `POST /webhook/mail` (spec §6) — consumes the provider's push
//! envelope opaquely; the core re-reads history via `WatchCoordinator`
//! rather than trusting envelope contents (spec §4.3 "push envelope is
//! consumed opaquely"). This endpoint is deliberately not behind the
//! same bearer-token scheme as `/api/v1` — provider push callbacks
//! authenticate by a separate verification token configured at
//! subscription time, out of scope for the core (spec §1 "no OAuth
//! flow").

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use extractor::EntityExtractor;
use provider::ProviderClient;
use serde::Deserialize;
use types::UserId;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MailWebhookBody {
    pub user_id: uuid::Uuid,
}

pub async fn webhook_mail<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    Json(body): Json<MailWebhookBody>,
) -> Result<StatusCode, ApiError> {
    let user_id = UserId(body.user_id);
    let user = state.store.get_user(user_id).await?.ok_or(ApiError::NotFound("user"))?;
    state.watch.handle_push(&user).await?;
    Ok(StatusCode::ACCEPTED)
}
