//! C10 — periodic ticks (spec §4.10): polling for C3, queue drain for C4
//! and C6, retroactive-scan slice generation, correction-processing pass,
//! watch renewal. No rigid scheduling framework; the contract is a
//! jittered interval and a singleflight lock per (user, job) so no two
//! instances of the same job overlap for one user.
//!
//! Grounded on the teacher's `smtp` queue manager's tick/backoff loop
//! (`crates/smtp/src/queue/manager.rs`), generalized from one global
//! queue loop to several independent per-user jobs sharing one
//! singleflight map, and on `resolver`'s per-(user, key) `DashMap` lock
//! pattern for that map's shape.

pub mod error;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use extractor::{EntityExtractor, ExtractionContext};
use labels::LabelReflector;
use parking_lot::Mutex as SyncMutex;
use provider::{ListQuery, ProviderClient};
use queue::{AiProcessingQueue, NotificationQueue, ProcessingTask};
use rand::Rng;
use resolver::{ProjectResolver, ResolveInput, ResolveOutcome};
use store::Store;
use tokio::sync::Mutex as AsyncMutex;
use types::{EventSource, MessageEvent, ProjectId, User, UserId};
use watch::{PollInterval, WatchCoordinator};

pub use error::SchedulerError;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// §9's open question on retroactive-scan slicing; a tunable, not a
    /// mandated value (SPEC_FULL §5).
    pub retro_scan_slice_size: i64,
    /// §9's "≥85%" grouping-accuracy target, wired as a configurable
    /// alert rather than a correctness gate.
    pub grouping_accuracy_alert_threshold: f64,
    pub grouping_accuracy_window: usize,
    /// Up to how many recent messages per candidate project feed signal
    /// 6 (pairwise similarity, spec §4.7).
    pub similarity_sample_size: i64,
    pub reconcile_batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retro_scan_slice_size: 50,
            grouping_accuracy_alert_threshold: 0.85,
            grouping_accuracy_window: 200,
            similarity_sample_size: 3,
            reconcile_batch_size: 50,
        }
    }
}

/// Rolling window of resolver outcomes (SPEC_FULL §5 supplement). There
/// is no labelled ground truth in production, so "confident" is used as
/// a proxy for "correct": an auto-assign that didn't need review. This
/// is an operational signal for alerting, never a correctness gate.
pub struct GroupingAccuracyTracker {
    window: VecDeque<bool>,
    capacity: usize,
}

impl GroupingAccuracyTracker {
    pub fn new(capacity: usize) -> Self {
        Self { window: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn record(&mut self, confident: bool) {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(confident);
    }

    pub fn accuracy(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let hits = self.window.iter().filter(|v| **v).count();
        Some(hits as f64 / self.window.len() as f64)
    }
}

/// Adds up to 25% jitter to a tick interval (spec §4.10 "every periodic
/// job has a jittered interval"). `main` wraps each tick loop's sleep in
/// this so that many users' ticks don't all land on the same instant.
pub fn jittered(base: StdDuration) -> StdDuration {
    let quarter = (base.as_millis() / 4).max(1) as u64;
    let jitter = rand::thread_rng().gen_range(0..=quarter);
    base + StdDuration::from_millis(jitter)
}

pub struct Scheduler<P: ProviderClient, E: EntityExtractor> {
    store: Arc<Store>,
    provider: Arc<P>,
    extractor: Arc<E>,
    watch: Arc<WatchCoordinator<P>>,
    notifications: Arc<NotificationQueue>,
    ai_queue: Arc<AiProcessingQueue>,
    resolver: Arc<ProjectResolver>,
    labels: Arc<LabelReflector<P>>,
    corrections: Arc<corrections::CorrectionStore>,
    config: SchedulerConfig,
    singleflight: DashMap<(UserId, &'static str), Arc<AsyncMutex<()>>>,
    accuracy: SyncMutex<GroupingAccuracyTracker>,
}

impl<P: ProviderClient, E: EntityExtractor> Scheduler<P, E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        provider: Arc<P>,
        extractor: Arc<E>,
        watch: Arc<WatchCoordinator<P>>,
        notifications: Arc<NotificationQueue>,
        ai_queue: Arc<AiProcessingQueue>,
        resolver: Arc<ProjectResolver>,
        labels: Arc<LabelReflector<P>>,
        corrections: Arc<corrections::CorrectionStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            extractor,
            watch,
            notifications,
            ai_queue,
            resolver,
            labels,
            corrections,
            config,
            singleflight: DashMap::new(),
            accuracy: SyncMutex::new(GroupingAccuracyTracker::new(config.grouping_accuracy_window)),
        }
    }

    fn lock_for(&self, user_id: UserId, job: &'static str) -> Arc<AsyncMutex<()>> {
        self.singleflight.entry((user_id, job)).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Runs `job` under a per-(user, job_name) singleflight lock. If
    /// another tick for the same job is already in flight for this user,
    /// this one is skipped outright rather than queued up behind it —
    /// the next tick will simply pick up where polling/draining left off.
    async fn run_singleflight<F, Fut>(&self, user_id: UserId, job_name: &'static str, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), SchedulerError>>,
    {
        let lock = self.lock_for(user_id, job_name);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(context = "scheduler", event = "singleflight-skip", user_id = %user_id, job = job_name, "Previous tick still running, skipping.");
            return Ok(());
        };
        f().await
    }

    /// Spec §4.3 poll tick, run for every active user.
    pub async fn poll_tick(&self, interval: PollInterval) -> Result<(), SchedulerError> {
        for user in self.store.list_active_users().await? {
            let watch = self.watch.clone();
            let duration = interval.as_duration();
            self.run_singleflight(user.id, "poll", || async move {
                watch.poll_tick(&user, duration).await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Renews push subscriptions within their renewal margin (spec §4.3).
    pub async fn renew_watches_tick(&self) -> Result<(), SchedulerError> {
        for user in self.store.list_active_users().await? {
            let watch = self.watch.clone();
            self.run_singleflight(user.id, "watch-renew", || async move {
                watch.renew_if_needed(&user, None, None).await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Drains C4: reserves notification events, fetches+parses via the
    /// provider, and hands off one `ProcessingTask::Extract` per message
    /// to C6 (spec §4.4 "workers take a reservation, call C2, hand off
    /// to C6").
    pub async fn drain_notifications(&self, max_items: usize) -> Result<usize, SchedulerError> {
        let mut handled = 0;
        for _ in 0..max_items {
            let Some(leased) = self.notifications.reserve().await? else {
                break;
            };
            match self.handle_notification(&leased.payload).await {
                Ok(()) => self.notifications.complete(&leased.id).await?,
                Err(e) if e.kind() == types::ErrorKind::AuthExpired => {
                    tracing::warn!(context = "scheduler", event = "auth-expired", item_id = %leased.id, user_id = %leased.user_id, "Marking user auth_expired, releasing item for re-consent (spec E6).");
                    self.store.set_auth_expired(leased.user_id, true).await?;
                    self.notifications.release(&leased.id).await?;
                }
                Err(e) => {
                    tracing::warn!(context = "scheduler", event = "notification-failed", item_id = %leased.id, error = %e, "Notification handling failed.");
                    self.notifications.fail(&leased.id, e.kind(), &e.to_string()).await?;
                }
            }
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle_notification(&self, event: &MessageEvent) -> Result<(), SchedulerError> {
        let Some(user) = self.store.get_user(event.user_id).await? else {
            return Ok(());
        };
        // Poll-sourced events already carry message/thread ids; a push
        // placeholder carries neither and must re-enumerate via
        // `get_history` first (spec §4.3) — that enumeration already ran
        // inside `WatchCoordinator::poll_tick`, so a bare push event with
        // no message id has nothing further to do here on its own.
        if event.message_id.is_empty() {
            return Ok(());
        }
        let message = self.provider.fetch_message(&user, &event.message_id, true).await?;
        let dedup_key = format!("extract:{}", message.message_id);
        self.ai_queue
            .enqueue(
                event.user_id,
                &dedup_key,
                &ProcessingTask::Extract { message_id: message.message_id.clone(), thread_id: message.thread_id.clone() },
                4,
            )
            .await?;
        Ok(())
    }

    /// Drains C6: reserves AI tasks and executes each `ProcessingTask`
    /// variant (spec §4.6/§4.7/§4.8).
    pub async fn drain_ai_processing(&self, max_items: usize) -> Result<usize, SchedulerError> {
        let mut handled = 0;
        for _ in 0..max_items {
            let Some(leased) = self.ai_queue.reserve().await? else {
                break;
            };
            let result = match &leased.payload {
                ProcessingTask::Extract { message_id, .. } => self.handle_extract(leased.user_id, message_id).await,
                ProcessingTask::GroupBatch { thread_id, message_ids } => self.handle_group_batch(leased.user_id, thread_id, message_ids).await,
                ProcessingTask::RetroactiveScanSlice { start, end, cursor } => self.handle_retro_slice(leased.user_id, *start, *end, cursor.clone()).await,
                ProcessingTask::ReflectLabels { message_id, project_id } => self.handle_reflect(leased.user_id, message_id, project_id).await,
            };
            match result {
                Ok(()) => self.ai_queue.complete(&leased.id).await?,
                Err(e) if e.kind() == types::ErrorKind::AuthExpired => {
                    tracing::warn!(context = "scheduler", event = "auth-expired", item_id = %leased.id, user_id = %leased.user_id, "Marking user auth_expired, releasing item for re-consent (spec E6).");
                    self.store.set_auth_expired(leased.user_id, true).await?;
                    self.ai_queue.release(&leased.id).await?;
                }
                Err(e) => {
                    tracing::warn!(context = "scheduler", event = "ai-task-failed", item_id = %leased.id, error = %e, "AI task failed.");
                    self.ai_queue.fail(&leased.id, e.kind(), &e.to_string()).await?;
                }
            }
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle_extract(&self, user_id: UserId, message_id: &str) -> Result<(), SchedulerError> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(());
        };
        let message = self.provider.fetch_message(&user, message_id, true).await?;
        let candidates = self.store.list_projects(user_id, Some(types::ProjectStatus::Active)).await?;
        let hints: Vec<String> = candidates.iter().map(|p| p.name.clone()).collect();

        let entities = self.extractor.extract(ExtractionContext { message: &message, existing_project_hints: &hints }).await?;

        let similarity_by_project = self.similarity_by_project(&user, &message, &candidates).await?;

        let outcome = self
            .resolver
            .resolve(ResolveInput { user_id, message: &message, entities: &entities, similarity_by_project: &similarity_by_project })
            .await?;

        self.record_outcome(&outcome);
        Ok(())
    }

    /// Signal 6 (spec §4.7): best pairwise-similarity score against up to
    /// `similarity_sample_size` recent messages per candidate project.
    async fn similarity_by_project(
        &self,
        user: &User,
        message: &types::Message,
        candidates: &[types::Project],
    ) -> Result<std::collections::HashMap<ProjectId, f64>, SchedulerError> {
        let mut scores = std::collections::HashMap::new();
        for candidate in candidates {
            let samples = self.store.list_recent_mappings_for_project(user.id, &candidate.id, self.config.similarity_sample_size).await?;
            let mut best = 0.0_f64;
            for sample in samples {
                if sample.message_id == message.message_id {
                    continue;
                }
                let Ok(sample_message) = self.provider.fetch_message(user, &sample.message_id, true).await else {
                    continue;
                };
                if let Ok(result) = self.extractor.compare(message, &sample_message).await {
                    best = best.max(result.score);
                }
            }
            if best > 0.0 {
                scores.insert(candidate.id.clone(), best);
            }
        }
        Ok(scores)
    }

    fn record_outcome(&self, outcome: &ResolveOutcome) {
        let confident = matches!(outcome, ResolveOutcome::Assigned { needs_review: false, .. });
        let mut tracker = self.accuracy.lock();
        tracker.record(confident);
        if let Some(accuracy) = tracker.accuracy() {
            if accuracy < self.config.grouping_accuracy_alert_threshold {
                tracing::warn!(context = "scheduler", event = "grouping-accuracy-low", accuracy, threshold = self.config.grouping_accuracy_alert_threshold, "Grouping accuracy below alert threshold.");
            }
        }
    }

    pub fn grouping_accuracy(&self) -> Option<f64> {
        self.accuracy.lock().accuracy()
    }

    /// §4.7 names `group_batch` as a payload kind but leaves its exact
    /// trigger to the caller; here it re-resolves every message in a
    /// thread against the same entities already on file for the thread's
    /// primary mapping, useful after a correction changes what "the
    /// thread's project" means.
    async fn handle_group_batch(&self, user_id: UserId, thread_id: &str, message_ids: &[String]) -> Result<(), SchedulerError> {
        tracing::info!(context = "scheduler", event = "group-batch", user_id = %user_id, thread_id, count = message_ids.len(), "Re-grouping thread batch.");
        for message_id in message_ids {
            self.handle_extract(user_id, message_id).await?;
        }
        Ok(())
    }

    async fn handle_reflect(&self, user_id: UserId, message_id: &str, project_id: &str) -> Result<(), SchedulerError> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(());
        };
        let project_id = ProjectId(project_id.to_string());
        let Some(project) = self.store.get_project(user_id, &project_id).await? else {
            return Ok(());
        };
        let Some(mapping) = self.store.get_active_mapping(user_id, message_id).await? else {
            return Ok(());
        };
        self.labels.reflect_mapping(&user, &mapping, &project).await?;
        Ok(())
    }

    /// Starts a retroactive scan (SPEC_FULL §5 "implemented as slice-based
    /// admission through scheduler"). The first slice carries no cursor;
    /// each slice enqueues up to `retro_scan_slice_size` messages as
    /// `EventSource::Retro` notifications and, if the provider reports
    /// more results, re-enqueues itself with the next cursor.
    pub async fn enqueue_retroactive_scan(&self, user_id: UserId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), SchedulerError> {
        let dedup_key = format!("retro:{}:{}:{}", user_id, start.timestamp(), end.timestamp());
        self.ai_queue.enqueue(user_id, &dedup_key, &ProcessingTask::RetroactiveScanSlice { start, end, cursor: None }, 9).await?;
        Ok(())
    }

    async fn handle_retro_slice(&self, user_id: UserId, start: DateTime<Utc>, end: DateTime<Utc>, cursor: Option<String>) -> Result<(), SchedulerError> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(());
        };
        let query_str = format!("after:{} before:{}", start.format("%Y/%m/%d"), end.format("%Y/%m/%d"));
        let page = self
            .provider
            .list_messages(
                &user,
                ListQuery { query: Some(&query_str), cursor: cursor.as_deref(), page_size: self.config.retro_scan_slice_size as u32 },
            )
            .await?;

        for message_id in &page.message_ids {
            let event = MessageEvent {
                user_id,
                message_id: message_id.clone(),
                thread_id: String::new(),
                history_cursor: String::new(),
                arrival_time: Utc::now(),
                source: EventSource::Retro,
                delivery_attempt: 0,
            };
            let dedup_key = format!("retro-msg:{message_id}");
            self.notifications.enqueue(user_id, &dedup_key, &event, 9).await?;
        }

        if let Some(next_cursor) = page.next_cursor {
            let dedup_key = format!("retro:{}:{}:{}:{}", user_id, start.timestamp(), end.timestamp(), next_cursor);
            self.ai_queue
                .enqueue(user_id, &dedup_key, &ProcessingTask::RetroactiveScanSlice { start, end, cursor: Some(next_cursor) }, 9)
                .await?;
        }
        tracing::info!(context = "scheduler", event = "retro-slice", user_id = %user_id, count = page.message_ids.len(), "Admitted retroactive scan slice.");
        Ok(())
    }

    /// Slow-cadence learning pass (spec §4.9), run per active user.
    pub async fn process_corrections_tick(&self) -> Result<(), SchedulerError> {
        for user in self.store.list_active_users().await? {
            let corrections = self.corrections.clone();
            self.run_singleflight(user.id, "corrections", || async move {
                corrections.process_unprocessed(user.id).await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Reconciliation pass for mappings still flagged `reflection_pending`
    /// (spec §4.8 supplement).
    pub async fn reconcile_labels_tick(&self) -> Result<(), SchedulerError> {
        for user in self.store.list_active_users().await? {
            let labels = self.labels.clone();
            let limit = self.config.reconcile_batch_size;
            self.run_singleflight(user.id, "reconcile-labels", || async move {
                labels.reconcile_pending(&user, limit).await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extractor::stub::StubEntityExtractor;
    use provider::fake::FakeProviderClient;
    use types::{Credentials, MessageHeaders, Role};

    async fn test_store() -> Arc<Store> {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Arc::new(store)
    }

    fn sample_user() -> User {
        User {
            id: UserId(uuid::Uuid::new_v4()),
            email: "crew@example.com".into(),
            credentials: Credentials { access_token_ciphertext: vec![], refresh_token_ciphertext: vec![], expires_at: Utc::now() + chrono::Duration::hours(1) },
            role: Role::User,
            active: true,
            auth_expired: false,
            created_at: Utc::now(),
        }
    }

    fn build_scheduler(store: Arc<Store>, provider: Arc<FakeProviderClient>) -> Scheduler<FakeProviderClient, StubEntityExtractor> {
        let notifications = Arc::new(queue::notification_queue(store.clone(), StdDuration::from_secs(30), 3));
        let ai_queue = Arc::new(queue::ai_processing_queue(store.clone(), StdDuration::from_secs(60), 3));
        let watch = Arc::new(WatchCoordinator::new(store.clone(), provider.clone(), notifications.clone(), 60));
        let resolver = Arc::new(ProjectResolver::new(store.clone(), ai_queue.clone()));
        let label_reflector = Arc::new(LabelReflector::new(store.clone(), provider.clone(), labels::LabelReflectorConfig::default()));
        let corrections_store = Arc::new(corrections::CorrectionStore::new(store.clone()));
        Scheduler::new(
            store,
            provider,
            Arc::new(StubEntityExtractor::default()),
            watch,
            notifications,
            ai_queue,
            resolver,
            label_reflector,
            corrections_store,
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn grouping_accuracy_tracker_windows_and_alerts() {
        let mut tracker = GroupingAccuracyTracker::new(4);
        for _ in 0..3 {
            tracker.record(true);
        }
        tracker.record(false);
        assert_eq!(tracker.accuracy(), Some(0.75));

        tracker.record(false);
        assert_eq!(tracker.accuracy(), Some(0.5));
    }

    #[tokio::test]
    async fn drain_notifications_enqueues_an_extract_task() {
        let store = test_store().await;
        let provider = Arc::new(FakeProviderClient::new());
        let user = sample_user();
        store.upsert_user(&user).await.unwrap();

        provider.seed_message(
            user.id,
            types::Message {
                message_id: "m1".into(),
                thread_id: "t1".into(),
                headers: MessageHeaders::default(),
                text_body: "job 42 at 5 Elm St".into(),
                snippet: String::new(),
                attachments: vec![],
                label_ids: vec![],
            },
        );

        let scheduler = build_scheduler(store, provider);
        let event = MessageEvent {
            user_id: user.id,
            message_id: "m1".into(),
            thread_id: "t1".into(),
            history_cursor: "c1".into(),
            arrival_time: Utc::now(),
            source: EventSource::Poll,
            delivery_attempt: 0,
        };
        scheduler.notifications.enqueue(user.id, "m1:c1", &event, 5).await.unwrap();

        let handled = scheduler.drain_notifications(10).await.unwrap();
        assert_eq!(handled, 1);

        let stats = scheduler.ai_queue.peek_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn retroactive_scan_admits_messages_into_notifications() {
        let store = test_store().await;
        let provider = Arc::new(FakeProviderClient::new());
        let user = sample_user();
        store.upsert_user(&user).await.unwrap();
        for id in ["r1", "r2"] {
            provider.seed_message(
                user.id,
                types::Message {
                    message_id: id.into(),
                    thread_id: "t-retro".into(),
                    headers: MessageHeaders::default(),
                    text_body: String::new(),
                    snippet: String::new(),
                    attachments: vec![],
                    label_ids: vec![],
                },
            );
        }

        let scheduler = build_scheduler(store, provider);
        let start = Utc::now() - chrono::Duration::days(30);
        let end = Utc::now();
        scheduler.enqueue_retroactive_scan(user.id, start, end).await.unwrap();

        let handled = scheduler.drain_ai_processing(10).await.unwrap();
        assert_eq!(handled, 1);

        let stats = scheduler.notifications.peek_stats().await.unwrap();
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn singleflight_skips_overlapping_tick_for_same_user() {
        let store = test_store().await;
        let provider = Arc::new(FakeProviderClient::new());
        let scheduler = build_scheduler(store, provider);
        let user_id = UserId(uuid::Uuid::new_v4());

        let lock = scheduler.lock_for(user_id, "poll");
        let _held = lock.lock().await;

        let result = scheduler
            .run_singleflight(user_id, "poll", || async { panic!("should not run while locked") })
            .await;
        assert!(result.is_ok());
    }
}
