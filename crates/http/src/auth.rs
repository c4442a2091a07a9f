//! Bearer auth (spec §6 "all routes require bearer auth") plus the
//! tenant-scoping header every route needs: the bearer token is a
//! shared service secret, not a per-user session, so the caller
//! additionally names which mailbox owner it's acting on behalf of via
//! `X-User-Id`. A real deployment would replace the shared secret with
//! per-user OAuth session tokens; that flow is explicitly out of scope
//! (spec §1 "no OAuth flow").

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use extractor::EntityExtractor;
use provider::ProviderClient;
use types::UserId;

use crate::error::ApiError;
use crate::state::AppState;

pub struct AuthenticatedUser(pub UserId);

impl<P, E, S> FromRequestParts<S> for AuthenticatedUser
where
    P: ProviderClient,
    E: EntityExtractor,
    S: Send + Sync,
    AppState<P, E>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::<P, E>::from_ref(state);

        let provided = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        if provided != app_state.auth_token.as_ref() || app_state.auth_token.is_empty() {
            return Err(ApiError::Unauthorized);
        }

        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| uuid::Uuid::parse_str(v).ok())
            .map(UserId)
            .ok_or_else(|| ApiError::BadRequest("missing or invalid X-User-Id header".into()))?;

        Ok(AuthenticatedUser(user_id))
    }
}
