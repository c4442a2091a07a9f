//! C4 NotificationQueue and C6 AIProcessingQueue (spec §4.4, §4.6) — one
//! generic durable lease queue, parameterized over payload type, the way
//! the teacher's own `smtp` queue reuses one `QueueId`/message shape
//! across outbound domains. Persistence is delegated to `store`; this
//! crate only adds the typed reserve/complete/fail contract and the
//! `tracing` spans spec SPEC_FULL §1 calls for.

pub mod error;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use store::Store;
use types::{ErrorKind, QueueStatus, UserId};

pub use error::QueueError;

/// C6 payload kinds (spec §4.6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessingTask {
    Extract { message_id: String, thread_id: String },
    GroupBatch { thread_id: String, message_ids: Vec<String> },
    RetroactiveScanSlice { start: chrono::DateTime<chrono::Utc>, end: chrono::DateTime<chrono::Utc>, cursor: Option<String> },
    /// Emitted by the resolver after `resolve_message` commits (spec §4.7
    /// side effects, "enqueue a label-reflection task to C8").
    ReflectLabels { message_id: String, project_id: String },
}

pub const NOTIFICATIONS: &str = "notifications";
pub const AI_PROCESSING: &str = "ai_processing";

#[derive(Debug, Clone)]
pub struct LeasedItem<T> {
    pub id: String,
    pub user_id: UserId,
    pub attempts: u32,
    pub payload: T,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub dead: i64,
}

/// A typed view over one `queue_name` partition of `store`'s shared
/// `queue_items` table.
pub struct Queue<T> {
    store: Arc<Store>,
    queue_name: &'static str,
    lease: Duration,
    max_attempts: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<Store>, queue_name: &'static str, lease: StdDuration, max_attempts: u32) -> Self {
        Self {
            store,
            queue_name,
            lease: Duration::from_std(lease).unwrap_or_else(|_| Duration::seconds(60)),
            max_attempts,
            _marker: PhantomData,
        }
    }

    pub async fn enqueue(&self, user_id: UserId, dedup_key: &str, item: &T, priority: i32) -> Result<bool, QueueError> {
        let payload = serde_json::to_value(item).map_err(|e| QueueError::BadPayload(e.to_string()))?;
        let span = telemetry::queue_span!(self.queue_name, dedup_key);
        let _enter = span.enter();
        tracing::info!(context = "queue", event = "enqueue", priority, "Enqueued item.");
        Ok(self.store.enqueue(self.queue_name, user_id, dedup_key, &payload, priority).await?)
    }

    /// Leases one item, deserializing its payload. A malformed payload is
    /// treated as a dead-letter-worthy `ExtractionParse` failure rather
    /// than panicking a worker.
    pub async fn reserve(&self) -> Result<Option<LeasedItem<T>>, QueueError> {
        let Some(record) = self.store.lease_next(self.queue_name, self.lease).await? else {
            return Ok(None);
        };
        let span = telemetry::queue_span!(self.queue_name, record.id);
        let _enter = span.enter();
        match serde_json::from_value::<T>(record.payload_json.clone()) {
            Ok(payload) => {
                tracing::info!(context = "queue", event = "reserved", attempts = record.attempts, "Reserved item.");
                Ok(Some(LeasedItem {
                    id: record.id,
                    user_id: record.user_id,
                    attempts: record.attempts,
                    payload,
                }))
            }
            Err(e) => {
                tracing::error!(context = "queue", event = "bad-payload", error = %e, "Dead-lettering item with malformed payload.");
                self.store.fail_queue_item(&record.id, false, self.max_attempts, &format!("bad payload: {e}")).await?;
                Err(QueueError::BadPayload(e.to_string()))
            }
        }
    }

    pub async fn complete(&self, id: &str) -> Result<(), QueueError> {
        tracing::info!(context = "queue", event = "complete", queue = self.queue_name, item_id = %id);
        Ok(self.store.complete_queue_item(id).await?)
    }

    /// Classifies `kind` per spec §7's propagation policy: retryable
    /// kinds get backoff + re-visibility, everything else (and anything
    /// past `max_attempts`) is dead-lettered.
    pub async fn fail(&self, id: &str, kind: ErrorKind, error_summary: &str) -> Result<(), QueueError> {
        let retryable = kind.is_retryable();
        if !retryable {
            tracing::warn!(context = "queue", event = "fail-dead", queue = self.queue_name, item_id = %id, error = error_summary, "Failing item as non-retryable.");
        } else {
            tracing::warn!(context = "queue", event = "fail-retry", queue = self.queue_name, item_id = %id, error = error_summary, "Failing item, will retry if attempts remain.");
        }
        Ok(self.store.fail_queue_item(id, retryable, self.max_attempts, error_summary).await?)
    }

    /// Releases a leased item back to pending without counting it as a
    /// failed attempt (spec §7/E6 AuthExpired: "released back to
    /// pending, no mappings lost" — not a backoff-and-retry failure of
    /// the item itself, but of the user's credentials).
    pub async fn release(&self, id: &str) -> Result<(), QueueError> {
        tracing::info!(context = "queue", event = "release", queue = self.queue_name, item_id = %id, "Releasing item back to pending.");
        Ok(self.store.release_queue_item(id).await?)
    }

    pub async fn peek_stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            pending: self.store.queue_depth(self.queue_name, QueueStatus::Pending).await?,
            processing: self.store.queue_depth(self.queue_name, QueueStatus::Processing).await?,
            dead: self.store.queue_depth(self.queue_name, QueueStatus::Dead).await?,
        })
    }

    /// Admin-only (spec §4.4 "dead items are inspected via an admin
    /// interface only").
    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<store::QueueRecord>, QueueError> {
        Ok(self.store.list_dead_letters(self.queue_name, limit).await?)
    }

    pub async fn replay_dead_letter(&self, id: &str) -> Result<(), QueueError> {
        tracing::info!(context = "queue", event = "admin-replay", queue = self.queue_name, item_id = %id, "Admin requeue of a dead letter.");
        Ok(self.store.requeue_dead_letter(id).await?)
    }
}

pub type NotificationQueue = Queue<types::MessageEvent>;
pub type AiProcessingQueue = Queue<ProcessingTask>;

pub fn notification_queue(store: Arc<Store>, lease: StdDuration, max_attempts: u32) -> NotificationQueue {
    Queue::new(store, NOTIFICATIONS, lease, max_attempts)
}

pub fn ai_processing_queue(store: Arc<Store>, lease: StdDuration, max_attempts: u32) -> AiProcessingQueue {
    Queue::new(store, AI_PROCESSING, lease, max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{EventSource, MessageEvent};

    async fn test_store() -> Arc<Store> {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Arc::new(store)
    }

    fn sample_event(user_id: UserId, message_id: &str) -> MessageEvent {
        MessageEvent {
            user_id,
            message_id: message_id.into(),
            thread_id: "thread-1".into(),
            history_cursor: "c1".into(),
            arrival_time: chrono::Utc::now(),
            source: EventSource::Push,
            delivery_attempt: 0,
        }
    }

    #[tokio::test]
    async fn reserve_then_complete_clears_the_item() {
        let store = test_store().await;
        let queue = notification_queue(store, StdDuration::from_secs(30), 3);
        let user_id = UserId(uuid::Uuid::new_v4());
        queue.enqueue(user_id, "m1:c1", &sample_event(user_id, "m1"), 1).await.unwrap();

        let leased = queue.reserve().await.unwrap().unwrap();
        assert_eq!(leased.payload.message_id, "m1");
        queue.complete(&leased.id).await.unwrap();

        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_failure_eventually_dead_letters() {
        let store = test_store().await;
        let queue = notification_queue(store, StdDuration::from_secs(30), 2);
        let user_id = UserId(uuid::Uuid::new_v4());
        queue.enqueue(user_id, "m2:c1", &sample_event(user_id, "m2"), 1).await.unwrap();

        let leased = queue.reserve().await.unwrap().unwrap();
        queue.fail(&leased.id, ErrorKind::Transient, "network blip").await.unwrap();

        let leased_again = queue.reserve().await.unwrap();
        assert!(leased_again.is_none(), "item should not be visible until backoff elapses");

        let stats = queue.peek_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let store = test_store().await;
        let queue = notification_queue(store, StdDuration::from_secs(30), 3);
        let user_id = UserId(uuid::Uuid::new_v4());
        queue.enqueue(user_id, "m3:c1", &sample_event(user_id, "m3"), 1).await.unwrap();

        let leased = queue.reserve().await.unwrap().unwrap();
        queue.fail(&leased.id, ErrorKind::ExtractionParse, "schema mismatch").await.unwrap();

        let stats = queue.peek_stats().await.unwrap();
        assert_eq!(stats.dead, 1);

        let dead = queue.list_dead_letters(10).await.unwrap();
        queue.replay_dead_letter(&dead[0].id).await.unwrap();
        assert_eq!(queue.peek_stats().await.unwrap().pending, 1);
    }
}
