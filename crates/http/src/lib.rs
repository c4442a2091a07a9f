//! The exposed `/api/v1` surface (spec §6), built on `axum`. The
//! teacher's own `http` crate wraps `hyper` directly with a hand-rolled
//! router; this crate reaches for `axum` + `tower-http` instead (see
//! DESIGN.md) while keeping the teacher's habit of one typed handler
//! per route, state injected rather than read from globals, and every
//! error routed through one `IntoResponse` conversion.

pub mod admin;
pub mod auth;
pub mod error;
pub mod projects;
pub mod scan;
pub mod state;
pub mod webhook;

use axum::routing::{delete, get, post};
use axum::Router;
use extractor::EntityExtractor;
use provider::ProviderClient;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Builds the full router for one `(ProviderClient, EntityExtractor)`
/// pairing. `main` mounts this under the process's bind address.
pub fn router<P, E>(state: AppState<P, E>) -> Router
where
    P: ProviderClient + 'static,
    E: EntityExtractor + 'static,
{
    Router::new()
        .route("/api/v1/projects", get(projects::list_projects::<P, E>))
        .route("/api/v1/projects/:id", get(projects::get_project::<P, E>).patch(projects::patch_project::<P, E>))
        .route("/api/v1/projects/:id/emails", post(projects::assign_email::<P, E>))
        .route("/api/v1/projects/:id/emails/:mid", delete(projects::unassign_email::<P, E>))
        .route("/api/v1/projects/:id/merge", post(projects::merge_project::<P, E>))
        .route("/api/v1/projects/:id/split", post(projects::split_project::<P, E>))
        .route("/api/v1/projects/:id/events", get(projects::project_events::<P, E>))
        .route("/api/v1/scan/ondemand", post(scan::scan_ondemand::<P, E>))
        .route("/api/v1/scan/retroactive", post(scan::scan_retroactive::<P, E>))
        .route("/api/v1/queue", get(admin::queue_stats::<P, E>))
        .route("/api/v1/queue/process", post(admin::process_queues::<P, E>))
        .route("/api/v1/queue/dead", get(admin::list_dead_letters::<P, E>))
        .route("/api/v1/queue/dead/:id/replay", post(admin::replay_dead_letter::<P, E>))
        .route("/webhook/mail", post(webhook::webhook_mail::<P, E>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use extractor::stub::StubEntityExtractor;
    use provider::fake::FakeProviderClient;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use store::Store;
    use tower::ServiceExt;
    use types::{Credentials, Role, User, UserId};

    const TOKEN: &str = "test-token";

    async fn test_state() -> (AppState<FakeProviderClient, StubEntityExtractor>, User) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let store = Arc::new(store);
        let provider = Arc::new(FakeProviderClient::new());

        let notifications = Arc::new(queue::notification_queue(store.clone(), StdDuration::from_secs(30), 3));
        let ai_queue = Arc::new(queue::ai_processing_queue(store.clone(), StdDuration::from_secs(60), 3));
        let watch = Arc::new(watch::WatchCoordinator::new(store.clone(), provider.clone(), notifications.clone(), 60));
        let resolver = Arc::new(resolver::ProjectResolver::new(store.clone(), ai_queue.clone()));
        let label_reflector = Arc::new(labels::LabelReflector::new(store.clone(), provider.clone(), labels::LabelReflectorConfig::default()));
        let corrections_store = Arc::new(corrections::CorrectionStore::new(store.clone()));
        let scheduler = Arc::new(scheduler::Scheduler::new(
            store.clone(),
            provider.clone(),
            Arc::new(StubEntityExtractor::default()),
            watch.clone(),
            notifications.clone(),
            ai_queue.clone(),
            resolver.clone(),
            label_reflector.clone(),
            corrections_store.clone(),
            scheduler::SchedulerConfig::default(),
        ));

        let user = User {
            id: UserId(uuid::Uuid::new_v4()),
            email: "crew@example.com".into(),
            credentials: Credentials { access_token_ciphertext: vec![], refresh_token_ciphertext: vec![], expires_at: chrono::Utc::now() + chrono::Duration::hours(1) },
            role: Role::User,
            active: true,
            auth_expired: false,
            created_at: chrono::Utc::now(),
        };
        store.upsert_user(&user).await.unwrap();

        let state = AppState::new(store, provider, watch, notifications, ai_queue, resolver, label_reflector, corrections_store, scheduler, TOKEN);
        (state, user)
    }

    #[tokio::test]
    async fn rejects_missing_bearer_token() {
        let (state, _user) = test_state().await;
        let app = router(state);
        let response = app.oneshot(Request::builder().uri("/api/v1/projects").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn lists_empty_projects_for_new_user() {
        let (state, user) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/projects")
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .header("x-user-id", user.id.0.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn assign_email_creates_mapping_and_correction() {
        let (state, user) = test_state().await;
        let project = types::Project {
            id: types::ProjectId::new(),
            user_id: user.id,
            name: "Smith Residence".into(),
            aliases: Default::default(),
            address: None,
            job_numbers: Default::default(),
            client: Default::default(),
            status: types::ProjectStatus::Active,
            email_count: 0,
            last_email_at: None,
            creation_confidence: types::Confidence::new(0.9),
            needs_review: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        state.store.create_project(&project).await.unwrap();
        state.provider.seed_message(
            user.id,
            types::Message {
                message_id: "m1".into(),
                thread_id: "t1".into(),
                headers: types::MessageHeaders::default(),
                text_body: String::new(),
                snippet: String::new(),
                attachments: vec![],
                label_ids: vec![],
            },
        );

        let app = router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/projects/{}/emails", project.id.0))
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .header("x-user-id", user.id.0.to_string())
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&serde_json::json!({ "message_id": "m1" })).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::CREATED);

        let mapping = state.store.get_active_mapping(user.id, "m1").await.unwrap().unwrap();
        assert_eq!(mapping.project_id, project.id);
    }
}
