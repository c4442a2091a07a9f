//! Row <-> domain-type conversions. Kept separate from `lib.rs` the way
//! the teacher splits storage dispatch/write/query concerns into their
//! own submodules (`crates/store/src/{dispatch,query,write}`).

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use types::*;

use crate::error::StoreError;

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp {raw:?}: {e}")))
}

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn to_bool(v: i64) -> bool {
    v != 0
}

pub fn from_bool(v: bool) -> i64 {
    if v {
        1
    } else {
        0
    }
}

pub fn user_from_row(row: &AnyRow) -> Result<User, StoreError> {
    let id: String = row.try_get("id")?;
    let role: String = row.try_get("role")?;
    let expires_at: String = row.try_get("expires_at")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(User {
        id: UserId(uuid::Uuid::parse_str(&id).map_err(|e| StoreError::Decode(e.to_string()))?),
        email: row.try_get("email")?,
        credentials: Credentials {
            access_token_ciphertext: row.try_get("access_token_ciphertext")?,
            refresh_token_ciphertext: row.try_get("refresh_token_ciphertext")?,
            expires_at: parse_ts(&expires_at)?,
        },
        role: match role.as_str() {
            "admin" => Role::Admin,
            "viewer" => Role::Viewer,
            _ => Role::User,
        },
        active: to_bool(row.try_get::<i64, _>("active")?),
        auth_expired: to_bool(row.try_get::<i64, _>("auth_expired")?),
        created_at: parse_ts(&created_at)?,
    })
}

pub fn role_str(role: Role) -> &'static str {
    match role {
        Role::Admin => "admin",
        Role::User => "user",
        Role::Viewer => "viewer",
    }
}

pub fn status_str(status: ProjectStatus) -> &'static str {
    match status {
        ProjectStatus::Active => "active",
        ProjectStatus::Completed => "completed",
        ProjectStatus::OnHold => "on_hold",
        ProjectStatus::Archived => "archived",
    }
}

pub fn status_from_str(s: &str) -> ProjectStatus {
    match s {
        "completed" => ProjectStatus::Completed,
        "on_hold" => ProjectStatus::OnHold,
        "archived" => ProjectStatus::Archived,
        _ => ProjectStatus::Active,
    }
}

pub fn project_from_row(row: &AnyRow) -> Result<Project, StoreError> {
    let user_id: String = row.try_get("user_id")?;
    let id: String = row.try_get("id")?;
    let aliases_json: String = row.try_get("aliases_json")?;
    let address_json: Option<String> = row.try_get("address_json")?;
    let job_numbers_json: String = row.try_get("job_numbers_json")?;
    let client_json: String = row.try_get("client_json")?;
    let status: String = row.try_get("status")?;
    let last_email_at: Option<String> = row.try_get("last_email_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Project {
        id: ProjectId(id),
        user_id: UserId(uuid::Uuid::parse_str(&user_id).map_err(|e| StoreError::Decode(e.to_string()))?),
        name: row.try_get("name")?,
        aliases: serde_json::from_str(&aliases_json).map_err(|e| StoreError::Decode(e.to_string()))?,
        address: match address_json {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Decode(e.to_string()))?,
            None => None,
        },
        job_numbers: serde_json::from_str(&job_numbers_json).map_err(|e| StoreError::Decode(e.to_string()))?,
        client: serde_json::from_str(&client_json).map_err(|e| StoreError::Decode(e.to_string()))?,
        status: status_from_str(&status),
        email_count: row.try_get::<i64, _>("email_count")? as u64,
        last_email_at: last_email_at.map(|s| parse_ts(&s)).transpose()?,
        creation_confidence: Confidence::new(row.try_get("creation_confidence")?),
        needs_review: to_bool(row.try_get::<i64, _>("needs_review")?),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

pub fn method_str(m: AssociationMethod) -> &'static str {
    match m {
        AssociationMethod::Auto => "auto",
        AssociationMethod::Ai => "ai",
        AssociationMethod::Similarity => "similarity",
        AssociationMethod::Manual => "manual",
    }
}

pub fn method_from_str(s: &str) -> AssociationMethod {
    match s {
        "ai" => AssociationMethod::Ai,
        "similarity" => AssociationMethod::Similarity,
        "manual" => AssociationMethod::Manual,
        _ => AssociationMethod::Auto,
    }
}

pub fn mapping_from_row(row: &AnyRow) -> Result<EmailProjectMapping, StoreError> {
    let user_id: String = row.try_get("user_id")?;
    let project_id: String = row.try_get("project_id")?;
    let method: String = row.try_get("association_method")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(EmailProjectMapping {
        message_id: row.try_get("message_id")?,
        thread_id: row.try_get("thread_id")?,
        user_id: UserId(uuid::Uuid::parse_str(&user_id).map_err(|e| StoreError::Decode(e.to_string()))?),
        project_id: ProjectId(project_id),
        confidence: Confidence::new(row.try_get("confidence")?),
        association_method: method_from_str(&method),
        primary: to_bool(row.try_get::<i64, _>("is_primary")?),
        active: to_bool(row.try_get::<i64, _>("active")?),
        needs_review: to_bool(row.try_get::<i64, _>("needs_review")?),
        split_from_thread: to_bool(row.try_get::<i64, _>("split_from_thread")?),
        reflection_pending: to_bool(row.try_get::<i64, _>("reflection_pending")?),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

pub fn category_str(c: AttachmentCategory) -> &'static str {
    match c {
        AttachmentCategory::Document => "document",
        AttachmentCategory::Spreadsheet => "spreadsheet",
        AttachmentCategory::Image => "image",
        AttachmentCategory::Drawing => "drawing",
        AttachmentCategory::Archive => "archive",
        AttachmentCategory::Other => "other",
    }
}

pub fn category_from_str(s: &str) -> AttachmentCategory {
    match s {
        "spreadsheet" => AttachmentCategory::Spreadsheet,
        "image" => AttachmentCategory::Image,
        "drawing" => AttachmentCategory::Drawing,
        "archive" => AttachmentCategory::Archive,
        "document" => AttachmentCategory::Document,
        _ => AttachmentCategory::Other,
    }
}

pub fn attachment_from_row(row: &AnyRow) -> Result<Attachment, StoreError> {
    let user_id: String = row.try_get("user_id")?;
    let category: String = row.try_get("category")?;
    let project_id: Option<String> = row.try_get("project_id")?;
    Ok(Attachment {
        message_id: row.try_get("message_id")?,
        user_id: UserId(uuid::Uuid::parse_str(&user_id).map_err(|e| StoreError::Decode(e.to_string()))?),
        provider_attachment_id: row.try_get("provider_attachment_id")?,
        filename: row.try_get("filename")?,
        mime: row.try_get("mime")?,
        size: row.try_get::<i64, _>("size")? as u64,
        category: category_from_str(&category),
        project_id: project_id.map(ProjectId),
        blob_ref: row.try_get("blob_ref")?,
    })
}

pub fn correction_type_str(t: CorrectionType) -> &'static str {
    match t {
        CorrectionType::Assign => "assign",
        CorrectionType::Unassign => "unassign",
        CorrectionType::Merge => "merge",
        CorrectionType::Split => "split",
        CorrectionType::Rename => "rename",
    }
}

pub fn correction_type_from_str(s: &str) -> CorrectionType {
    match s {
        "unassign" => CorrectionType::Unassign,
        "merge" => CorrectionType::Merge,
        "split" => CorrectionType::Split,
        "rename" => CorrectionType::Rename,
        _ => CorrectionType::Assign,
    }
}

pub fn correction_from_row(row: &AnyRow) -> Result<Correction, StoreError> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let correction_type: String = row.try_get("correction_type")?;
    let original_result_json: String = row.try_get("original_result_json")?;
    let corrected_result_json: String = row.try_get("corrected_result_json")?;
    let project_id: Option<String> = row.try_get("project_id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Correction {
        id: uuid::Uuid::parse_str(&id).map_err(|e| StoreError::Decode(e.to_string()))?,
        user_id: UserId(uuid::Uuid::parse_str(&user_id).map_err(|e| StoreError::Decode(e.to_string()))?),
        correction_type: correction_type_from_str(&correction_type),
        original_result: serde_json::from_str(&original_result_json).map_err(|e| StoreError::Decode(e.to_string()))?,
        corrected_result: serde_json::from_str(&corrected_result_json).map_err(|e| StoreError::Decode(e.to_string()))?,
        message_id: row.try_get("message_id")?,
        project_id: project_id.map(ProjectId),
        reason: row.try_get("reason")?,
        processed: to_bool(row.try_get::<i64, _>("processed")?),
        created_at: parse_ts(&created_at)?,
    })
}

pub fn pattern_kind_str(k: PatternKind) -> &'static str {
    match k {
        PatternKind::Alias => "alias",
        PatternKind::SenderToProject => "sender_to_project",
        PatternKind::AddressToProject => "address_to_project",
    }
}

pub fn pattern_kind_from_str(s: &str) -> PatternKind {
    match s {
        "sender_to_project" => PatternKind::SenderToProject,
        "address_to_project" => PatternKind::AddressToProject,
        _ => PatternKind::Alias,
    }
}

pub fn pattern_from_row(row: &AnyRow) -> Result<LearningPattern, StoreError> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let kind: String = row.try_get("kind")?;
    let project_id: String = row.try_get("project_id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(LearningPattern {
        id: uuid::Uuid::parse_str(&id).map_err(|e| StoreError::Decode(e.to_string()))?,
        user_id: UserId(uuid::Uuid::parse_str(&user_id).map_err(|e| StoreError::Decode(e.to_string()))?),
        kind: pattern_kind_from_str(&kind),
        pattern_body: row.try_get("pattern_body")?,
        project_id: ProjectId(project_id),
        confidence: Confidence::new(row.try_get("confidence")?),
        usage_count: row.try_get::<i64, _>("usage_count")? as u64,
        active: to_bool(row.try_get::<i64, _>("active")?),
        created_at: parse_ts(&created_at)?,
    })
}

pub fn watch_kind_str(k: WatchKind) -> &'static str {
    match k {
        WatchKind::Push => "push",
        WatchKind::Polling => "polling",
    }
}

pub fn watch_kind_from_str(s: &str) -> WatchKind {
    match s {
        "push" => WatchKind::Push,
        _ => WatchKind::Polling,
    }
}

pub fn watch_from_row(row: &AnyRow) -> Result<WatchSubscription, StoreError> {
    let user_id: String = row.try_get("user_id")?;
    let kind: String = row.try_get("kind")?;
    let expires_at: String = row.try_get("expires_at")?;
    Ok(WatchSubscription {
        user_id: UserId(uuid::Uuid::parse_str(&user_id).map_err(|e| StoreError::Decode(e.to_string()))?),
        topic: row.try_get("topic")?,
        history_cursor: row.try_get("history_cursor")?,
        expires_at: parse_ts(&expires_at)?,
        kind: watch_kind_from_str(&kind),
    })
}
