//! Metastore (C11): durable state for users, projects, mappings,
//! attachments, corrections, learning patterns, watch subscriptions,
//! resolver events and the two work queues.
//!
//! Grounded on the teacher's `crates/store` dispatch/query/write split,
//! but where the teacher hand-rolls a KV layer over rocksdb/foundationdb
//! with an `Archiver` trait, this crate uses `sqlx`'s `Any` driver so the
//! same SQL runs against SQLite (dev/test) and Postgres (production)
//! without a bespoke serialization format. See DESIGN.md.

pub mod error;
pub mod queue_model;
pub mod rows;
mod schema;

use chrono::Utc;
use sqlx::any::{AnyPool, AnyPoolOptions};
use sqlx::Row;
use types::*;

pub use error::StoreError;
pub use queue_model::QueueRecord;

#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------

    pub async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO users
                (id, email, access_token_ciphertext, refresh_token_ciphertext, expires_at, role, active, auth_expired, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                access_token_ciphertext = excluded.access_token_ciphertext,
                refresh_token_ciphertext = excluded.refresh_token_ciphertext,
                expires_at = excluded.expires_at,
                role = excluded.role,
                active = excluded.active,
                auth_expired = excluded.auth_expired"#,
        )
        .bind(user.id.0.to_string())
        .bind(&user.email)
        .bind(&user.credentials.access_token_ciphertext)
        .bind(&user.credentials.refresh_token_ciphertext)
        .bind(rows::fmt_ts(user.credentials.expires_at))
        .bind(rows::role_str(user.role))
        .bind(rows::from_bool(user.active))
        .bind(rows::from_bool(user.auth_expired))
        .bind(rows::fmt_ts(user.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rows::user_from_row).transpose()
    }

    pub async fn set_auth_expired(&self, id: UserId, expired: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET auth_expired = ? WHERE id = ?")
            .bind(rows::from_bool(expired))
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Excludes `auth_expired` users (spec §7/E6: "no further fetch
    /// attempts for this user until re-consent").
    pub async fn list_active_users(&self) -> Result<Vec<User>, StoreError> {
        let result = sqlx::query("SELECT * FROM users WHERE active = 1 AND auth_expired = 0")
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(rows::user_from_row).collect()
    }

    // ---------------------------------------------------------------
    // Projects
    // ---------------------------------------------------------------

    pub async fn create_project(&self, project: &Project) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO projects
                (id, user_id, name, aliases_json, address_json, job_numbers_json, client_json,
                 status, email_count, last_email_at, creation_confidence, needs_review, version,
                 created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(&project.id.0)
        .bind(project.user_id.0.to_string())
        .bind(&project.name)
        .bind(serde_json::to_string(&project.aliases).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(
            project
                .address
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Decode(e.to_string()))?,
        )
        .bind(serde_json::to_string(&project.job_numbers).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(serde_json::to_string(&project.client).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(rows::status_str(project.status))
        .bind(project.email_count as i64)
        .bind(project.last_email_at.map(rows::fmt_ts))
        .bind(project.creation_confidence.value())
        .bind(rows::from_bool(project.needs_review))
        .bind(rows::fmt_ts(project.created_at))
        .bind(rows::fmt_ts(project.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, user_id: UserId, id: &ProjectId) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query("SELECT * FROM projects WHERE user_id = ? AND id = ?")
            .bind(user_id.0.to_string())
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rows::project_from_row).transpose()
    }

    /// The row's internal optimistic-concurrency counter, for callers
    /// that need to read-modify-write a project (spec §7
    /// PersistenceConflict) without exposing `version` on the domain
    /// type itself.
    pub async fn get_project_version(&self, user_id: UserId, id: &ProjectId) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT version FROM projects WHERE user_id = ? AND id = ?")
            .bind(user_id.0.to_string())
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<i64, _>("version").map_err(StoreError::from)).transpose()
    }

    pub async fn list_projects(&self, user_id: UserId, status: Option<ProjectStatus>) -> Result<Vec<Project>, StoreError> {
        let result = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM projects WHERE user_id = ? AND status = ? ORDER BY name")
                    .bind(user_id.0.to_string())
                    .bind(rows::status_str(s))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM projects WHERE user_id = ? ORDER BY name")
                    .bind(user_id.0.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        result.iter().map(rows::project_from_row).collect()
    }

    /// Updates every mutable field, enforcing optimistic concurrency on
    /// `version` (spec §7 PersistenceConflict).
    pub async fn update_project(&self, project: &Project, expected_version: i64) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"UPDATE projects SET
                name = ?, aliases_json = ?, address_json = ?, job_numbers_json = ?, client_json = ?,
                status = ?, email_count = ?, last_email_at = ?, creation_confidence = ?,
                needs_review = ?, updated_at = ?, version = version + 1
               WHERE user_id = ? AND id = ? AND version = ?"#,
        )
        .bind(&project.name)
        .bind(serde_json::to_string(&project.aliases).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(
            project
                .address
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Decode(e.to_string()))?,
        )
        .bind(serde_json::to_string(&project.job_numbers).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(serde_json::to_string(&project.client).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(rows::status_str(project.status))
        .bind(project.email_count as i64)
        .bind(project.last_email_at.map(rows::fmt_ts))
        .bind(project.creation_confidence.value())
        .bind(rows::from_bool(project.needs_review))
        .bind(rows::fmt_ts(Utc::now()))
        .bind(project.user_id.0.to_string())
        .bind(&project.id.0)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::Conflict {
                entity: "project",
                id: project.id.0.clone(),
            });
        }
        Ok(())
    }

    pub async fn archive_project(&self, user_id: UserId, id: &ProjectId) -> Result<(), StoreError> {
        sqlx::query("UPDATE projects SET status = 'archived', updated_at = ? WHERE user_id = ? AND id = ?")
            .bind(rows::fmt_ts(Utc::now()))
            .bind(user_id.0.to_string())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Mappings
    // ---------------------------------------------------------------

    /// Atomically records a resolved association: deactivates any other
    /// active mapping for the same message, upserts this mapping as the
    /// active one, and bumps the project's rolling counters — the
    /// transactional core of the resolver's write path (spec §5, §7).
    pub async fn resolve_message(&self, mapping: &EmailProjectMapping) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = rows::fmt_ts(Utc::now());

        sqlx::query(
            "UPDATE mappings SET active = 0, updated_at = ? WHERE user_id = ? AND message_id = ? AND project_id != ? AND active = 1",
        )
        .bind(&now)
        .bind(mapping.user_id.0.to_string())
        .bind(&mapping.message_id)
        .bind(&mapping.project_id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"INSERT INTO mappings
                (message_id, thread_id, user_id, project_id, confidence, association_method,
                 is_primary, active, needs_review, split_from_thread, reflection_pending,
                 created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id, message_id, project_id) DO UPDATE SET
                confidence = excluded.confidence,
                association_method = excluded.association_method,
                is_primary = excluded.is_primary,
                active = 1,
                needs_review = excluded.needs_review,
                split_from_thread = excluded.split_from_thread,
                reflection_pending = excluded.reflection_pending,
                updated_at = excluded.updated_at"#,
        )
        .bind(&mapping.message_id)
        .bind(&mapping.thread_id)
        .bind(mapping.user_id.0.to_string())
        .bind(&mapping.project_id.0)
        .bind(mapping.confidence.value())
        .bind(rows::method_str(mapping.association_method))
        .bind(rows::from_bool(mapping.primary))
        .bind(rows::from_bool(mapping.needs_review))
        .bind(rows::from_bool(mapping.split_from_thread))
        .bind(rows::from_bool(mapping.reflection_pending))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let affected = sqlx::query(
            "UPDATE projects SET email_count = email_count + 1, last_email_at = ?, updated_at = ?, version = version + 1 WHERE user_id = ? AND id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(mapping.user_id.0.to_string())
        .bind(&mapping.project_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict {
                entity: "project",
                id: mapping.project_id.0.clone(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_active_mapping(&self, user_id: UserId, message_id: &str) -> Result<Option<EmailProjectMapping>, StoreError> {
        let row = sqlx::query("SELECT * FROM mappings WHERE user_id = ? AND message_id = ? AND active = 1")
            .bind(user_id.0.to_string())
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rows::mapping_from_row).transpose()
    }

    pub async fn list_thread_mappings(&self, user_id: UserId, thread_id: &str) -> Result<Vec<EmailProjectMapping>, StoreError> {
        let result = sqlx::query("SELECT * FROM mappings WHERE user_id = ? AND thread_id = ? AND active = 1 ORDER BY created_at")
            .bind(user_id.0.to_string())
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(rows::mapping_from_row).collect()
    }

    pub async fn list_recent_mappings_for_project(
        &self,
        user_id: UserId,
        project_id: &ProjectId,
        limit: i64,
    ) -> Result<Vec<EmailProjectMapping>, StoreError> {
        let result = sqlx::query(
            "SELECT * FROM mappings WHERE user_id = ? AND project_id = ? AND active = 1 ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id.0.to_string())
        .bind(&project_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        result.iter().map(rows::mapping_from_row).collect()
    }

    pub async fn set_reflection_pending(&self, user_id: UserId, message_id: &str, project_id: &ProjectId, pending: bool) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE mappings SET reflection_pending = ?, updated_at = ? WHERE user_id = ? AND message_id = ? AND project_id = ?",
        )
        .bind(rows::from_bool(pending))
        .bind(rows::fmt_ts(Utc::now()))
        .bind(user_id.0.to_string())
        .bind(message_id)
        .bind(&project_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_reflection_pending(&self, user_id: UserId, limit: i64) -> Result<Vec<EmailProjectMapping>, StoreError> {
        let result = sqlx::query(
            "SELECT * FROM mappings WHERE user_id = ? AND reflection_pending = 1 AND active = 1 ORDER BY updated_at LIMIT ?",
        )
        .bind(user_id.0.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        result.iter().map(rows::mapping_from_row).collect()
    }

    /// Manual unassign (spec §6 `DELETE /projects/{id}/emails/{mid}`):
    /// deactivates the mapping and recomputes the project's rolling
    /// counters from its remaining active mappings, transactionally.
    pub async fn deactivate_mapping(&self, user_id: UserId, message_id: &str, project_id: &ProjectId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = rows::fmt_ts(Utc::now());

        let affected = sqlx::query(
            "UPDATE mappings SET active = 0, updated_at = ? WHERE user_id = ? AND message_id = ? AND project_id = ? AND active = 1",
        )
        .bind(&now)
        .bind(user_id.0.to_string())
        .bind(message_id)
        .bind(&project_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r#"UPDATE projects SET
                email_count = (SELECT COUNT(*) FROM mappings WHERE user_id = ? AND project_id = ? AND active = 1),
                last_email_at = (SELECT MAX(created_at) FROM mappings WHERE user_id = ? AND project_id = ? AND active = 1),
                updated_at = ?, version = version + 1
               WHERE user_id = ? AND id = ?"#,
        )
        .bind(user_id.0.to_string())
        .bind(&project_id.0)
        .bind(user_id.0.to_string())
        .bind(&project_id.0)
        .bind(&now)
        .bind(user_id.0.to_string())
        .bind(&project_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------

    pub async fn upsert_attachment(&self, attachment: &Attachment) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO attachments
                (message_id, user_id, provider_attachment_id, filename, mime, size, category, project_id, blob_ref)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id, message_id, provider_attachment_id) DO UPDATE SET
                project_id = excluded.project_id,
                blob_ref = excluded.blob_ref"#,
        )
        .bind(&attachment.message_id)
        .bind(attachment.user_id.0.to_string())
        .bind(&attachment.provider_attachment_id)
        .bind(&attachment.filename)
        .bind(&attachment.mime)
        .bind(attachment.size as i64)
        .bind(rows::category_str(attachment.category))
        .bind(attachment.project_id.as_ref().map(|p| p.0.clone()))
        .bind(&attachment.blob_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_attachments_for_message(&self, user_id: UserId, message_id: &str) -> Result<Vec<Attachment>, StoreError> {
        let result = sqlx::query("SELECT * FROM attachments WHERE user_id = ? AND message_id = ?")
            .bind(user_id.0.to_string())
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(rows::attachment_from_row).collect()
    }

    pub async fn reassign_attachments(&self, user_id: UserId, message_id: &str, project_id: &ProjectId) -> Result<(), StoreError> {
        sqlx::query("UPDATE attachments SET project_id = ? WHERE user_id = ? AND message_id = ?")
            .bind(&project_id.0)
            .bind(user_id.0.to_string())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Corrections
    // ---------------------------------------------------------------

    pub async fn append_correction(&self, correction: &Correction) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO corrections
                (id, user_id, correction_type, original_result_json, corrected_result_json,
                 message_id, project_id, reason, processed, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(correction.id.to_string())
        .bind(correction.user_id.0.to_string())
        .bind(rows::correction_type_str(correction.correction_type))
        .bind(serde_json::to_string(&correction.original_result).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(serde_json::to_string(&correction.corrected_result).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(&correction.message_id)
        .bind(correction.project_id.as_ref().map(|p| p.0.clone()))
        .bind(&correction.reason)
        .bind(rows::from_bool(correction.processed))
        .bind(rows::fmt_ts(correction.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_unprocessed_corrections(&self, user_id: UserId) -> Result<Vec<Correction>, StoreError> {
        let result = sqlx::query("SELECT * FROM corrections WHERE user_id = ? AND processed = 0 ORDER BY created_at")
            .bind(user_id.0.to_string())
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(rows::correction_from_row).collect()
    }

    pub async fn mark_correction_processed(&self, id: uuid::Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE corrections SET processed = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Learning patterns
    // ---------------------------------------------------------------

    pub async fn upsert_learning_pattern(&self, pattern: &LearningPattern) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO learning_patterns
                (id, user_id, kind, pattern_body, project_id, confidence, usage_count, active, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                confidence = excluded.confidence,
                usage_count = excluded.usage_count,
                active = excluded.active"#,
        )
        .bind(pattern.id.to_string())
        .bind(pattern.user_id.0.to_string())
        .bind(rows::pattern_kind_str(pattern.kind))
        .bind(&pattern.pattern_body)
        .bind(&pattern.project_id.0)
        .bind(pattern.confidence.value())
        .bind(pattern.usage_count as i64)
        .bind(rows::from_bool(pattern.active))
        .bind(rows::fmt_ts(pattern.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_active_patterns(&self, user_id: UserId) -> Result<Vec<LearningPattern>, StoreError> {
        let result = sqlx::query("SELECT * FROM learning_patterns WHERE user_id = ? AND active = 1")
            .bind(user_id.0.to_string())
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(rows::pattern_from_row).collect()
    }

    /// Unlike `list_active_patterns`, includes patterns still below the
    /// min-support threshold — needed so `corrections::bump_pattern` can
    /// find and increment a not-yet-active pattern instead of inserting
    /// a duplicate row each time.
    pub async fn list_all_patterns(&self, user_id: UserId) -> Result<Vec<LearningPattern>, StoreError> {
        let result = sqlx::query("SELECT * FROM learning_patterns WHERE user_id = ?")
            .bind(user_id.0.to_string())
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(rows::pattern_from_row).collect()
    }

    pub async fn deactivate_pattern(&self, id: uuid::Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE learning_patterns SET active = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Watch subscriptions
    // ---------------------------------------------------------------

    pub async fn upsert_watch_subscription(&self, sub: &WatchSubscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO watch_subscriptions (user_id, topic, history_cursor, expires_at, kind)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                topic = excluded.topic,
                history_cursor = excluded.history_cursor,
                expires_at = excluded.expires_at,
                kind = excluded.kind"#,
        )
        .bind(sub.user_id.0.to_string())
        .bind(&sub.topic)
        .bind(&sub.history_cursor)
        .bind(rows::fmt_ts(sub.expires_at))
        .bind(rows::watch_kind_str(sub.kind))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_watch_subscription(&self, user_id: UserId) -> Result<Option<WatchSubscription>, StoreError> {
        let row = sqlx::query("SELECT * FROM watch_subscriptions WHERE user_id = ?")
            .bind(user_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rows::watch_from_row).transpose()
    }

    /// Watches within `margin` of expiry, for the renewal sweep (spec §4.2).
    pub async fn list_watches_expiring_before(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<WatchSubscription>, StoreError> {
        let result = sqlx::query("SELECT * FROM watch_subscriptions WHERE expires_at < ?")
            .bind(rows::fmt_ts(cutoff))
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(rows::watch_from_row).collect()
    }

    // ---------------------------------------------------------------
    // Resolver events (supplemented: multi_project_detected / low_confidence UI feed)
    // ---------------------------------------------------------------

    pub async fn record_resolver_event(&self, user_id: UserId, message_id: &str, event_kind: &str, payload: &serde_json::Value) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO resolver_events (id, user_id, message_id, event_kind, payload_json, created_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(user_id.0.to_string())
            .bind(message_id)
            .bind(event_kind)
            .bind(serde_json::to_string(payload).map_err(|e| StoreError::Decode(e.to_string()))?)
            .bind(rows::fmt_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_resolver_events(&self, user_id: UserId, limit: i64) -> Result<Vec<(String, String, serde_json::Value)>, StoreError> {
        let result = sqlx::query("SELECT message_id, event_kind, payload_json FROM resolver_events WHERE user_id = ? ORDER BY created_at DESC LIMIT ?")
            .bind(user_id.0.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        result
            .iter()
            .map(|row| {
                let payload_json: String = row.try_get("payload_json")?;
                Ok((
                    row.try_get::<String, _>("message_id")?,
                    row.try_get::<String, _>("event_kind")?,
                    serde_json::from_str(&payload_json).map_err(|e| StoreError::Decode(e.to_string()))?,
                ))
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Merge / split support (corrections crate, spec §4.9)
    // ---------------------------------------------------------------

    /// Reassigns every active mapping, attachment, and alias from
    /// `source` onto `target`, then archives `source`. Used by a
    /// project-merge correction.
    pub async fn merge_projects(&self, user_id: UserId, source: &ProjectId, target: &ProjectId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = rows::fmt_ts(Utc::now());

        sqlx::query(
            "UPDATE mappings SET active = 0, updated_at = ? WHERE user_id = ? AND project_id = ? AND message_id IN (SELECT message_id FROM mappings WHERE user_id = ? AND project_id = ? AND active = 1)",
        )
        .bind(&now)
        .bind(user_id.0.to_string())
        .bind(&target.0)
        .bind(user_id.0.to_string())
        .bind(&source.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE mappings SET project_id = ?, updated_at = ? WHERE user_id = ? AND project_id = ? AND active = 1")
            .bind(&target.0)
            .bind(&now)
            .bind(user_id.0.to_string())
            .bind(&source.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE attachments SET project_id = ? WHERE user_id = ? AND project_id = ?")
            .bind(&target.0)
            .bind(user_id.0.to_string())
            .bind(&source.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE projects SET status = 'archived', updated_at = ? WHERE user_id = ? AND id = ?")
            .bind(&now)
            .bind(user_id.0.to_string())
            .bind(&source.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE projects SET email_count = (SELECT COUNT(*) FROM mappings WHERE user_id = ? AND project_id = ? AND active = 1), updated_at = ?, version = version + 1 WHERE user_id = ? AND id = ?",
        )
        .bind(user_id.0.to_string())
        .bind(&target.0)
        .bind(&now)
        .bind(user_id.0.to_string())
        .bind(&target.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Moves one mapping onto a freshly created project, for a thread-split
    /// correction (spec §4.9's `split_from_thread` flag).
    pub async fn split_mapping_onto_project(&self, user_id: UserId, message_id: &str, new_project: &Project) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = rows::fmt_ts(Utc::now());

        self.insert_project_tx(&mut tx, new_project).await?;

        sqlx::query("UPDATE mappings SET active = 0, updated_at = ? WHERE user_id = ? AND message_id = ? AND active = 1")
            .bind(&now)
            .bind(user_id.0.to_string())
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT INTO mappings
                (message_id, thread_id, user_id, project_id, confidence, association_method,
                 is_primary, active, needs_review, split_from_thread, reflection_pending, created_at, updated_at)
               SELECT message_id, thread_id, user_id, ?, 1.0, 'manual', 1, 1, 0, 1, 0, ?, ?
               FROM mappings WHERE user_id = ? AND message_id = ? LIMIT 1"#,
        )
        .bind(&new_project.id.0)
        .bind(&now)
        .bind(&now)
        .bind(user_id.0.to_string())
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_project_tx(&self, tx: &mut sqlx::Transaction<'_, sqlx::Any>, project: &Project) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO projects
                (id, user_id, name, aliases_json, address_json, job_numbers_json, client_json,
                 status, email_count, last_email_at, creation_confidence, needs_review, version,
                 created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)"#,
        )
        .bind(&project.id.0)
        .bind(project.user_id.0.to_string())
        .bind(&project.name)
        .bind(serde_json::to_string(&project.aliases).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(
            project
                .address
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| StoreError::Decode(e.to_string()))?,
        )
        .bind(serde_json::to_string(&project.job_numbers).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(serde_json::to_string(&project.client).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(rows::status_str(project.status))
        .bind(project.email_count as i64)
        .bind(project.last_email_at.map(rows::fmt_ts))
        .bind(project.creation_confidence.value())
        .bind(rows::from_bool(project.needs_review))
        .bind(rows::fmt_ts(project.created_at))
        .bind(rows::fmt_ts(project.updated_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Queues (C4 notification queue, C6 AI processing queue)
    // ---------------------------------------------------------------

    /// Idempotent on `(queue_name, dedup_key)` (spec §4.4): a re-enqueue of
    /// an item already `pending`/`processing` bumps its priority to the
    /// max of the existing and new value rather than inserting a second
    /// row. Returns `true` if this call inserted a brand-new row.
    pub async fn enqueue(&self, queue_name: &str, user_id: UserId, dedup_key: &str, payload: &serde_json::Value, priority: i32) -> Result<bool, StoreError> {
        let now = rows::fmt_ts(Utc::now());
        let id = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"INSERT INTO queue_items
                (id, queue_name, user_id, dedup_key, payload_json, priority, status, attempts, next_visible_at, error_summary, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, NULL, ?, ?)
               ON CONFLICT(queue_name, dedup_key) DO UPDATE SET
                priority = MAX(queue_items.priority, excluded.priority)"#,
        )
        .bind(&id)
        .bind(queue_name)
        .bind(user_id.0.to_string())
        .bind(dedup_key)
        .bind(serde_json::to_string(payload).map_err(|e| StoreError::Decode(e.to_string()))?)
        .bind(priority)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        let _ = result;

        let inserted_id: String = sqlx::query("SELECT id FROM queue_items WHERE queue_name = ? AND dedup_key = ?")
            .bind(queue_name)
            .bind(dedup_key)
            .fetch_one(&self.pool)
            .await?
            .try_get("id")?;
        Ok(inserted_id == id)
    }

    /// Leases the highest-priority, oldest pending item whose
    /// `next_visible_at` has passed, marking it `processing` so a
    /// concurrent worker cannot also lease it.
    pub async fn lease_next(&self, queue_name: &str, lease: chrono::Duration) -> Result<Option<QueueRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now_dt = Utc::now();
        let now = rows::fmt_ts(now_dt);

        let row = sqlx::query(
            "SELECT * FROM queue_items WHERE queue_name = ? AND status = 'pending' AND next_visible_at <= ? ORDER BY priority ASC, created_at ASC LIMIT 1",
        )
        .bind(queue_name)
        .bind(&now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: String = row.try_get("id")?;
        let next_visible = rows::fmt_ts(now_dt + lease);

        sqlx::query("UPDATE queue_items SET status = 'processing', next_visible_at = ?, updated_at = ? WHERE id = ?")
            .bind(&next_visible)
            .bind(&now)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        queue_record_from_row(&row).map(Some)
    }

    /// Releases a leased item back to pending immediately, with no
    /// attempt-count increment or backoff — used when the failure is the
    /// user's expired credentials, not the item itself (spec §7/E6).
    pub async fn release_queue_item(&self, id: &str) -> Result<(), StoreError> {
        let now = rows::fmt_ts(Utc::now());
        sqlx::query("UPDATE queue_items SET status = 'pending', next_visible_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_queue_item(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE queue_items SET status = 'completed', updated_at = ? WHERE id = ?")
            .bind(rows::fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Retries with exponential backoff if `retryable` and under
    /// `max_attempts`, otherwise dead-letters (spec §7 propagation policy).
    pub async fn fail_queue_item(&self, id: &str, retryable: bool, max_attempts: u32, error_summary: &str) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT attempts FROM queue_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(()) };
        let attempts: i64 = row.try_get("attempts")?;
        let attempts = attempts as u32 + 1;
        let now = Utc::now();

        if retryable && attempts < max_attempts {
            let backoff_secs = 2i64.saturating_pow(attempts.min(10));
            sqlx::query("UPDATE queue_items SET status = 'pending', attempts = ?, next_visible_at = ?, error_summary = ?, updated_at = ? WHERE id = ?")
                .bind(attempts as i64)
                .bind(rows::fmt_ts(now + chrono::Duration::seconds(backoff_secs)))
                .bind(error_summary)
                .bind(rows::fmt_ts(now))
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE queue_items SET status = 'dead', attempts = ?, error_summary = ?, updated_at = ? WHERE id = ?")
                .bind(attempts as i64)
                .bind(error_summary)
                .bind(rows::fmt_ts(now))
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn list_dead_letters(&self, queue_name: &str, limit: i64) -> Result<Vec<QueueRecord>, StoreError> {
        let result = sqlx::query("SELECT * FROM queue_items WHERE queue_name = ? AND status = 'dead' ORDER BY updated_at DESC LIMIT ?")
            .bind(queue_name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        result.iter().map(queue_record_from_row).collect()
    }

    pub async fn requeue_dead_letter(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE queue_items SET status = 'pending', attempts = 0, next_visible_at = ?, error_summary = NULL, updated_at = ? WHERE id = ?")
            .bind(rows::fmt_ts(Utc::now()))
            .bind(rows::fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn queue_depth(&self, queue_name: &str, status: QueueStatus) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM queue_items WHERE queue_name = ? AND status = ?")
            .bind(queue_name)
            .bind(queue_model::status_str(status))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

fn queue_record_from_row(row: &sqlx::any::AnyRow) -> Result<QueueRecord, StoreError> {
    let user_id: String = row.try_get("user_id")?;
    let payload_json: String = row.try_get("payload_json")?;
    let status: String = row.try_get("status")?;
    let next_visible_at: String = row.try_get("next_visible_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(QueueRecord {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        user_id: UserId(uuid::Uuid::parse_str(&user_id).map_err(|e| StoreError::Decode(e.to_string()))?),
        dedup_key: row.try_get("dedup_key")?,
        payload_json: serde_json::from_str(&payload_json).map_err(|e| StoreError::Decode(e.to_string()))?,
        priority: row.try_get("priority")?,
        status: queue_model::status_from_str(&status),
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        next_visible_at: rows::parse_ts(&next_visible_at)?,
        error_summary: row.try_get("error_summary")?,
        created_at: rows::parse_ts(&created_at)?,
        updated_at: rows::parse_ts(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.expect("connect");
        store.migrate().await.expect("migrate");
        store
    }

    fn sample_user() -> User {
        User {
            id: UserId(uuid::Uuid::new_v4()),
            email: "crew@example.com".into(),
            credentials: Credentials {
                access_token_ciphertext: vec![1, 2, 3],
                refresh_token_ciphertext: vec![4, 5, 6],
                expires_at: Utc::now(),
            },
            role: Role::User,
            active: true,
            auth_expired: false,
            created_at: Utc::now(),
        }
    }

    fn sample_project(user_id: UserId, name: &str) -> Project {
        Project {
            id: ProjectId::new(),
            user_id,
            name: name.into(),
            aliases: Default::default(),
            address: None,
            job_numbers: Default::default(),
            client: ClientContact::default(),
            status: ProjectStatus::Active,
            email_count: 0,
            last_email_at: None,
            creation_confidence: Confidence::new(0.9),
            needs_review: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn round_trips_user_and_project() {
        let store = test_store().await;
        let user = sample_user();
        store.upsert_user(&user).await.unwrap();
        let fetched = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(fetched.email, user.email);

        let project = sample_project(user.id, "Smith Residence");
        store.create_project(&project).await.unwrap();
        let fetched = store.get_project(user.id, &project.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Smith Residence");
        assert_eq!(fetched.email_count, 0);
    }

    #[tokio::test]
    async fn resolve_message_bumps_project_counters_and_enforces_single_active_mapping() {
        let store = test_store().await;
        let user = sample_user();
        store.upsert_user(&user).await.unwrap();
        let project_a = sample_project(user.id, "Project A");
        let project_b = sample_project(user.id, "Project B");
        store.create_project(&project_a).await.unwrap();
        store.create_project(&project_b).await.unwrap();

        let mapping_a = EmailProjectMapping {
            message_id: "msg-1".into(),
            thread_id: "thread-1".into(),
            user_id: user.id,
            project_id: project_a.id.clone(),
            confidence: Confidence::new(0.95),
            association_method: AssociationMethod::Auto,
            primary: true,
            active: true,
            needs_review: false,
            split_from_thread: false,
            reflection_pending: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.resolve_message(&mapping_a).await.unwrap();

        let active = store.get_active_mapping(user.id, "msg-1").await.unwrap().unwrap();
        assert_eq!(active.project_id, project_a.id);

        let refreshed_a = store.get_project(user.id, &project_a.id).await.unwrap().unwrap();
        assert_eq!(refreshed_a.email_count, 1);

        let mapping_b = EmailProjectMapping {
            project_id: project_b.id.clone(),
            ..mapping_a
        };
        store.resolve_message(&mapping_b).await.unwrap();

        let active = store.get_active_mapping(user.id, "msg-1").await.unwrap().unwrap();
        assert_eq!(active.project_id, project_b.id);

        let threads = store.list_thread_mappings(user.id, "thread-1").await.unwrap();
        assert_eq!(threads.len(), 1);
    }

    #[tokio::test]
    async fn update_project_rejects_stale_version() {
        let store = test_store().await;
        let user = sample_user();
        store.upsert_user(&user).await.unwrap();
        let mut project = sample_project(user.id, "Lakeview Deck");
        store.create_project(&project).await.unwrap();

        project.name = "Lakeview Deck Rebuild".into();
        let err = store.update_project(&project, 7).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceConflict);

        store.update_project(&project, 0).await.unwrap();
        let fetched = store.get_project(user.id, &project.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Lakeview Deck Rebuild");
    }

    #[tokio::test]
    async fn queue_round_trips_lease_complete_and_dead_letter() {
        let store = test_store().await;
        let user = sample_user();
        store.upsert_user(&user).await.unwrap();

        let inserted = store
            .enqueue("notifications", user.id, "dedup-1", &serde_json::json!({"message_id": "m1"}), 0)
            .await
            .unwrap();
        assert!(inserted);

        let duplicate = store
            .enqueue("notifications", user.id, "dedup-1", &serde_json::json!({"message_id": "m1"}), 0)
            .await
            .unwrap();
        assert!(!duplicate);

        let leased = store.lease_next("notifications", chrono::Duration::seconds(30)).await.unwrap().unwrap();
        assert_eq!(leased.dedup_key, "dedup-1");

        store.fail_queue_item(&leased.id, true, 3, "transient boom").await.unwrap();
        assert_eq!(store.queue_depth("notifications", QueueStatus::Pending).await.unwrap(), 1);

        let leased_again = store.lease_next("notifications", chrono::Duration::seconds(30)).await.unwrap().unwrap();
        store.fail_queue_item(&leased_again.id, true, 1, "still failing").await.unwrap();
        let dead = store.list_dead_letters("notifications", 10).await.unwrap();
        assert_eq!(dead.len(), 1);

        store.requeue_dead_letter(&dead[0].id).await.unwrap();
        assert_eq!(store.queue_depth("notifications", QueueStatus::Pending).await.unwrap(), 1);
    }
}
