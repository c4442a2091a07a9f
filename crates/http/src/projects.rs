//! `/api/v1/projects` — spec §6's project CRUD/merge/split contracts.
//! Every mutating route records a `Correction` before returning, the way
//! the spec's error-handling section frames user edits as corrections
//! rather than silent overwrites.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use corrections::CorrectionHints;
use extractor::EntityExtractor;
use provider::ProviderClient;
use queue::ProcessingTask;
use serde::{Deserialize, Serialize};
use types::{AssociationMethod, Confidence, Correction, CorrectionType, EmailProjectMapping, Project, ProjectId, ProjectStatus};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListProjectsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub email_count: u64,
    pub last_email_at: Option<chrono::DateTime<Utc>>,
    pub needs_review: bool,
}

impl From<&Project> for ProjectSummary {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id.0.clone(),
            name: p.name.clone(),
            status: p.status,
            email_count: p.email_count,
            last_email_at: p.last_email_at,
            needs_review: p.needs_review,
        }
    }
}

fn parse_status(raw: &str) -> Result<ProjectStatus, ApiError> {
    match raw {
        "active" => Ok(ProjectStatus::Active),
        "completed" => Ok(ProjectStatus::Completed),
        "on_hold" => Ok(ProjectStatus::OnHold),
        "archived" => Ok(ProjectStatus::Archived),
        other => Err(ApiError::BadRequest(format!("unknown status {other}"))),
    }
}

pub async fn list_projects<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<ListProjectsQuery>,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let projects = state.store.list_projects(user_id, status).await?;
    Ok(Json(projects.iter().map(ProjectSummary::from).collect()))
}

pub async fn get_project<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .store
        .get_project(user_id, &ProjectId(project_id))
        .await?
        .ok_or(ApiError::NotFound("project"))?;
    Ok(Json(project))
}

#[derive(Debug, Deserialize)]
pub struct AssignEmailRequest {
    pub message_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub hints: CorrectionHints,
}

pub async fn assign_email<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(project_id): Path<String>,
    Json(body): Json<AssignEmailRequest>,
) -> Result<StatusCode, ApiError> {
    let project_id = ProjectId(project_id);
    let project = state.store.get_project(user_id, &project_id).await?.ok_or(ApiError::NotFound("project"))?;
    let user = state.store.get_user(user_id).await?.ok_or(ApiError::NotFound("user"))?;
    let message = state.provider.fetch_message(&user, &body.message_id, false).await?;

    let now = Utc::now();
    let mapping = EmailProjectMapping {
        message_id: message.message_id.clone(),
        thread_id: message.thread_id.clone(),
        user_id,
        project_id: project.id.clone(),
        confidence: Confidence::new(1.0),
        association_method: AssociationMethod::Manual,
        primary: true,
        active: true,
        needs_review: false,
        split_from_thread: false,
        reflection_pending: true,
        created_at: now,
        updated_at: now,
    };
    state.store.resolve_message(&mapping).await?;
    state.store.reassign_attachments(user_id, &message.message_id, &project.id).await?;

    state
        .corrections
        .record(&Correction {
            id: uuid::Uuid::new_v4(),
            user_id,
            correction_type: CorrectionType::Assign,
            original_result: serde_json::json!({}),
            corrected_result: serde_json::to_value(&body.hints).unwrap_or_default(),
            message_id: Some(message.message_id.clone()),
            project_id: Some(project.id.clone()),
            reason: body.reason,
            processed: false,
            created_at: now,
        })
        .await?;

    state
        .ai_queue
        .enqueue(
            user_id,
            &format!("reflect:{}:{}", project.id.0, message.message_id),
            &ProcessingTask::ReflectLabels { message_id: message.message_id, project_id: project.id.0 },
            6,
        )
        .await?;

    Ok(StatusCode::CREATED)
}

pub async fn unassign_email<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path((project_id, message_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let project_id = ProjectId(project_id);
    state.store.get_project(user_id, &project_id).await?.ok_or(ApiError::NotFound("project"))?;

    state.store.deactivate_mapping(user_id, &message_id, &project_id).await?;

    state
        .corrections
        .record(&Correction {
            id: uuid::Uuid::new_v4(),
            user_id,
            correction_type: CorrectionType::Unassign,
            original_result: serde_json::json!({ "project_id": project_id.0 }),
            corrected_result: serde_json::json!({}),
            message_id: Some(message_id),
            project_id: Some(project_id),
            reason: "manual unassign".into(),
            processed: false,
            created_at: Utc::now(),
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
pub struct PatchProjectRequest {
    pub name: Option<String>,
    pub add_alias: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub reason: String,
}

/// Renames/re-aliases/changes status, retrying the optimistic-lock
/// write a small bounded number of times (spec §7 "retried within the
/// transaction scope up to a small bound, then surfaced").
pub async fn patch_project<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(project_id): Path<String>,
    Json(body): Json<PatchProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    let project_id = ProjectId(project_id);
    let new_status = body.status.as_deref().map(parse_status).transpose()?;

    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 0;
    loop {
        let mut project = state.store.get_project(user_id, &project_id).await?.ok_or(ApiError::NotFound("project"))?;
        let version = state.store.get_project_version(user_id, &project_id).await?.ok_or(ApiError::NotFound("project"))?;

        let original = serde_json::json!({ "name": project.name, "status": project.status });
        if let Some(name) = &body.name {
            project.aliases.insert(Project::normalize_name(&project.name));
            project.name = name.clone();
        }
        if let Some(alias) = &body.add_alias {
            project.aliases.insert(alias.clone());
        }
        if let Some(status) = new_status {
            project.status = status;
        }
        project.updated_at = Utc::now();

        match state.store.update_project(&project, version).await {
            Ok(()) => {
                state
                    .corrections
                    .record(&Correction {
                        id: uuid::Uuid::new_v4(),
                        user_id,
                        correction_type: CorrectionType::Rename,
                        original_result: original,
                        corrected_result: serde_json::json!({ "name": project.name, "status": project.status }),
                        message_id: None,
                        project_id: Some(project.id.clone()),
                        reason: body.reason,
                        processed: false,
                        created_at: Utc::now(),
                    })
                    .await?;
                return Ok(Json(project));
            }
            Err(e) if e.kind() == types::ErrorKind::PersistenceConflict && attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MergeQuery {
    pub target: String,
}

pub async fn merge_project<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(project_id): Path<String>,
    Query(query): Query<MergeQuery>,
) -> Result<StatusCode, ApiError> {
    let source = ProjectId(project_id);
    let target = ProjectId(query.target);
    state.store.get_project(user_id, &source).await?.ok_or(ApiError::NotFound("project"))?;
    state.store.get_project(user_id, &target).await?.ok_or(ApiError::NotFound("target project"))?;

    state.corrections.merge_projects(user_id, &source, &target).await?;

    state
        .corrections
        .record(&Correction {
            id: uuid::Uuid::new_v4(),
            user_id,
            correction_type: CorrectionType::Merge,
            original_result: serde_json::json!({ "source": source.0 }),
            corrected_result: serde_json::json!({ "target": target.0 }),
            message_id: None,
            project_id: Some(target),
            reason: "manual merge".into(),
            processed: false,
            created_at: Utc::now(),
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SplitRequest {
    pub message_ids: Vec<String>,
    pub new_name: String,
}

pub async fn split_project<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(project_id): Path<String>,
    Json(body): Json<SplitRequest>,
) -> Result<Json<Project>, ApiError> {
    let source_id = ProjectId(project_id);
    let source = state.store.get_project(user_id, &source_id).await?.ok_or(ApiError::NotFound("project"))?;

    if body.message_ids.is_empty() {
        return Err(ApiError::BadRequest("message_ids must not be empty".into()));
    }

    let now = Utc::now();
    let new_project = Project {
        id: ProjectId::new(),
        user_id,
        name: body.new_name,
        aliases: Default::default(),
        address: source.address.clone(),
        job_numbers: Default::default(),
        client: source.client.clone(),
        status: ProjectStatus::Active,
        email_count: 0,
        last_email_at: None,
        creation_confidence: Confidence::new(1.0),
        needs_review: false,
        created_at: now,
        updated_at: now,
    };

    for message_id in &body.message_ids {
        state.corrections.split_message(user_id, message_id, &new_project).await?;
        state.store.reassign_attachments(user_id, message_id, &new_project.id).await?;
    }

    state
        .corrections
        .record(&Correction {
            id: uuid::Uuid::new_v4(),
            user_id,
            correction_type: CorrectionType::Split,
            original_result: serde_json::json!({ "source": source_id.0, "message_ids": body.message_ids }),
            corrected_result: serde_json::json!({ "new_project": new_project.id.0 }),
            message_id: None,
            project_id: Some(new_project.id.clone()),
            reason: "manual split".into(),
            processed: false,
            created_at: now,
        })
        .await?;

    let refreshed = state.store.get_project(user_id, &new_project.id).await?.ok_or(ApiError::NotFound("project"))?;
    Ok(Json(refreshed))
}

#[derive(Debug, Serialize)]
pub struct ResolverEventView {
    pub message_id: String,
    pub event_kind: String,
    pub payload: serde_json::Value,
}

pub async fn project_events<P: ProviderClient, E: EntityExtractor>(
    State(state): State<AppState<P, E>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<ResolverEventView>>, ApiError> {
    let project_id = ProjectId(project_id);
    let events = state.store.list_resolver_events(user_id, 200).await?;

    let mut matched = Vec::new();
    for (message_id, event_kind, payload) in events {
        let owns = match state.store.get_active_mapping(user_id, &message_id).await? {
            Some(mapping) => mapping.project_id == project_id,
            None => false,
        };
        if owns {
            matched.push(ResolverEventView { message_id, event_kind, payload });
        }
    }
    Ok(Json(matched))
}
