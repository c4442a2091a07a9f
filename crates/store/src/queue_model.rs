//! The queue table backs both the notification queue (C4) and the AI
//! processing queue (C6) — they differ only by `queue_name`. Kept as a
//! store-owned record type (not in `types`) because it is a storage
//! representation, not a domain object: callers in `queue` deserialize
//! `payload_json` into their own item type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use types::{QueueStatus, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: String,
    pub queue_name: String,
    pub user_id: UserId,
    pub dedup_key: String,
    pub payload_json: serde_json::Value,
    pub priority: i32,
    pub status: QueueStatus,
    pub attempts: u32,
    pub next_visible_at: DateTime<Utc>,
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn status_str(s: QueueStatus) -> &'static str {
    match s {
        QueueStatus::Pending => "pending",
        QueueStatus::Processing => "processing",
        QueueStatus::Completed => "completed",
        QueueStatus::Failed => "failed",
        QueueStatus::Dead => "dead",
    }
}

pub fn status_from_str(s: &str) -> QueueStatus {
    match s {
        "processing" => QueueStatus::Processing,
        "completed" => QueueStatus::Completed,
        "failed" => QueueStatus::Failed,
        "dead" => QueueStatus::Dead,
        _ => QueueStatus::Pending,
    }
}
