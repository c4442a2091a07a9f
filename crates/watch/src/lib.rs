//! C3 — maintains push subscriptions and the polling fallback, emitting
//! `MessageEvent`s into C4 (spec §4.3). Grounded on the teacher's own
//! `services`/`coordinator` crates, which likewise turn an external
//! notification (or a timer tick) into an internal queued work item
//! rather than acting on it inline.

pub mod error;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use provider::ProviderClient;
use queue::NotificationQueue;
use store::Store;
use types::{EventSource, MessageEvent, User, WatchKind, WatchSubscription};

pub use error::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
    Fast,
    Normal,
    Slow,
}

impl PollInterval {
    pub fn as_duration(self) -> StdDuration {
        match self {
            PollInterval::Fast => StdDuration::from_secs(60),
            PollInterval::Normal => StdDuration::from_secs(300),
            PollInterval::Slow => StdDuration::from_secs(900),
        }
    }
}

pub struct WatchCoordinator<P: ProviderClient> {
    store: Arc<Store>,
    provider: Arc<P>,
    queue: Arc<NotificationQueue>,
    renewal_margin: chrono::Duration,
    last_push_at: DashMap<types::UserId, DateTime<Utc>>,
}

impl<P: ProviderClient> WatchCoordinator<P> {
    pub fn new(store: Arc<Store>, provider: Arc<P>, queue: Arc<NotificationQueue>, renewal_margin_min: i64) -> Self {
        Self {
            store,
            provider,
            queue,
            renewal_margin: chrono::Duration::minutes(renewal_margin_min),
            last_push_at: DashMap::new(),
        }
    }

    /// Spec §4.3: the push envelope is consumed opaquely. It is not
    /// trusted to enumerate messages — it only proves "something
    /// changed", so the real work is a single placeholder event that
    /// tells a C4 worker to call `get_history` itself.
    pub async fn handle_push(&self, user: &User) -> Result<(), WatchError> {
        self.last_push_at.insert(user.id, Utc::now());
        let subscription = self.store.get_watch_subscription(user.id).await?;
        let cursor = subscription.map(|s| s.history_cursor).unwrap_or_default();

        let event = MessageEvent {
            user_id: user.id,
            message_id: String::new(),
            thread_id: String::new(),
            history_cursor: cursor,
            arrival_time: Utc::now(),
            source: EventSource::Push,
            delivery_attempt: 0,
        };
        let dedup_key = format!("push:{}:{}", user.id, uuid::Uuid::new_v4());
        self.queue.enqueue(user.id, &dedup_key, &event, 1).await?;
        tracing::info!(context = "watch", event = "push-received", user_id = %user.id, "Enqueued placeholder event for push notification.");
        Ok(())
    }

    /// Poll path (spec §4.3): skipped for users on an active push
    /// subscription who produced a push-driven event within `interval`.
    pub async fn poll_tick(&self, user: &User, interval: StdDuration) -> Result<usize, WatchError> {
        let subscription = self.store.get_watch_subscription(user.id).await?;
        if let Some(sub) = &subscription {
            if sub.kind == WatchKind::Push {
                if let Some(last) = self.last_push_at.get(&user.id) {
                    if Utc::now() - *last < chrono::Duration::from_std(interval).unwrap_or_default() {
                        return Ok(0);
                    }
                }
            }
        }

        let cursor = subscription.as_ref().map(|s| s.history_cursor.clone()).unwrap_or_default();
        let events = self.provider.get_history(user, &cursor).await?;
        let mut max_cursor = cursor.clone();
        let mut enqueued = 0;

        for event in &events {
            let message_event = MessageEvent {
                user_id: user.id,
                message_id: event.message_id.clone(),
                thread_id: event.thread_id.clone(),
                history_cursor: event.history_cursor.clone(),
                arrival_time: Utc::now(),
                source: EventSource::Poll,
                delivery_attempt: 0,
            };
            let dedup_key = format!("{}:{}", event.message_id, event.history_cursor);
            if self.queue.enqueue(user.id, &dedup_key, &message_event, 5).await? {
                enqueued += 1;
            }
            if event.history_cursor.as_str() > max_cursor.as_str() {
                max_cursor = event.history_cursor.clone();
            }
        }

        if max_cursor != cursor {
            self.store
                .upsert_watch_subscription(&WatchSubscription {
                    user_id: user.id,
                    topic: subscription.and_then(|s| s.topic),
                    history_cursor: max_cursor,
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                    kind: WatchKind::Polling,
                })
                .await?;
        }

        tracing::info!(context = "watch", event = "poll-tick", user_id = %user.id, enqueued, "Polled history.");
        Ok(enqueued)
    }

    /// Renews a push subscription inside `renewal_margin` of expiry
    /// (spec §4.3 "refreshed before expiry minus a safety margin").
    pub async fn renew_if_needed(&self, user: &User, topic: Option<&str>, label_filter: Option<&str>) -> Result<bool, WatchError> {
        let subscription = self.store.get_watch_subscription(user.id).await?;
        let needs_renewal = match &subscription {
            Some(sub) => sub.expires_at - Utc::now() <= self.renewal_margin,
            None => true,
        };
        if !needs_renewal {
            return Ok(false);
        }

        let handle = self.provider.start_watch(user, topic, label_filter).await?;
        self.store
            .upsert_watch_subscription(&WatchSubscription {
                user_id: user.id,
                topic: handle.topic,
                history_cursor: subscription.map(|s| s.history_cursor).unwrap_or_default(),
                expires_at: handle.expires_at,
                kind: WatchKind::Push,
            })
            .await?;
        tracing::info!(context = "watch", event = "renewed", user_id = %user.id, "Renewed push subscription.");
        Ok(true)
    }

    pub async fn teardown(&self, user: &User) -> Result<(), WatchError> {
        self.provider.stop_watch(user).await?;
        tracing::info!(context = "watch", event = "teardown", user_id = %user.id, "Tore down subscription.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provider::fake::FakeProviderClient;
    use std::sync::Arc;
    use types::{Credentials, Role, UserId};

    async fn setup() -> (Arc<Store>, Arc<NotificationQueue>, Arc<FakeProviderClient>) {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        store.migrate().await.unwrap();
        let queue = Arc::new(queue::notification_queue(store.clone(), StdDuration::from_secs(30), 3));
        (store, queue, Arc::new(FakeProviderClient::new()))
    }

    fn sample_user() -> User {
        User {
            id: UserId(uuid::Uuid::new_v4()),
            email: "crew@example.com".into(),
            credentials: Credentials {
                access_token_ciphertext: vec![],
                refresh_token_ciphertext: vec![],
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
            role: Role::User,
            active: true,
            auth_expired: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn push_enqueues_a_placeholder_event() {
        let (store, queue, provider) = setup().await;
        let coordinator = WatchCoordinator::new(store, provider, queue.clone(), 60);
        let user = sample_user();

        coordinator.handle_push(&user).await.unwrap();
        let leased = queue.reserve().await.unwrap().unwrap();
        assert_eq!(leased.payload.source, EventSource::Push);
        assert!(leased.payload.message_id.is_empty());
    }

    #[tokio::test]
    async fn poll_skips_user_with_recent_push_on_push_subscription() {
        let (store, queue, provider) = setup().await;
        let user = sample_user();
        store
            .upsert_watch_subscription(&WatchSubscription {
                user_id: user.id,
                topic: Some("topic".into()),
                history_cursor: "c0".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                kind: WatchKind::Push,
            })
            .await
            .unwrap();

        let coordinator = WatchCoordinator::new(store, provider.clone(), queue, 60);
        coordinator.handle_push(&user).await.unwrap();

        let enqueued = coordinator.poll_tick(&user, StdDuration::from_secs(300)).await.unwrap();
        assert_eq!(enqueued, 0);
    }

    #[tokio::test]
    async fn renew_if_needed_skips_fresh_subscription() {
        let (store, queue, provider) = setup().await;
        let user = sample_user();
        store
            .upsert_watch_subscription(&WatchSubscription {
                user_id: user.id,
                topic: Some("topic".into()),
                history_cursor: "c0".into(),
                expires_at: Utc::now() + chrono::Duration::hours(6),
                kind: WatchKind::Push,
            })
            .await
            .unwrap();

        let coordinator = WatchCoordinator::new(store, provider, queue, 60);
        let renewed = coordinator.renew_if_needed(&user, Some("topic"), None).await.unwrap();
        assert!(!renewed);
    }
}
