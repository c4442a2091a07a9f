//! Deterministic in-memory fake (spec SPEC_FULL §4 "Deterministic-Stub-for-tests").
//! No network; used by `resolver`, `queue` and `http` tests so they can
//! drive real control flow without a live mail API.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use types::{Message, User, UserId};

use crate::{HistoryEvent, Label, ListPage, ListQuery, ProfileInfo, ProviderClient, ProviderError, WatchHandle};

#[derive(Default)]
struct UserState {
    messages: HashMap<String, Message>,
    labels: Vec<Label>,
    history: Vec<HistoryEvent>,
    watch_active: bool,
}

#[derive(Default)]
pub struct FakeProviderClient {
    users: Mutex<HashMap<UserId, UserState>>,
}

impl FakeProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_message(&self, user_id: UserId, message: Message) {
        let mut users = self.users.lock();
        let state = users.entry(user_id).or_default();
        state.messages.insert(message.message_id.clone(), message);
    }

    pub fn seed_history(&self, user_id: UserId, event: HistoryEvent) {
        self.users.lock().entry(user_id).or_default().history.push(event);
    }

    pub fn label_ids_for(&self, user_id: UserId, message_id: &str) -> Vec<String> {
        self.users
            .lock()
            .get(&user_id)
            .and_then(|s| s.messages.get(message_id))
            .map(|m| m.label_ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderClient for FakeProviderClient {
    async fn profile(&self, user: &User) -> Result<ProfileInfo, ProviderError> {
        Ok(ProfileInfo { email: user.email.clone() })
    }

    async fn list_messages(&self, user: &User, _query: ListQuery<'_>) -> Result<ListPage, ProviderError> {
        let users = self.users.lock();
        let ids = users
            .get(&user.id)
            .map(|s| s.messages.keys().cloned().collect())
            .unwrap_or_default();
        Ok(ListPage { message_ids: ids, next_cursor: None })
    }

    async fn fetch_message(&self, user: &User, id: &str, _include_body: bool) -> Result<Message, ProviderError> {
        self.users
            .lock()
            .get(&user.id)
            .and_then(|s| s.messages.get(id).cloned())
            .ok_or_else(|| ProviderError::Parse(format!("no such seeded message {id}")))
    }

    async fn list_labels(&self, user: &User) -> Result<Vec<Label>, ProviderError> {
        Ok(self.users.lock().get(&user.id).map(|s| s.labels.clone()).unwrap_or_default())
    }

    async fn create_label(&self, user: &User, name: &str) -> Result<Label, ProviderError> {
        let mut users = self.users.lock();
        let state = users.entry(user.id).or_default();
        if let Some(existing) = state.labels.iter().find(|l| l.name.eq_ignore_ascii_case(name)) {
            return Ok(existing.clone());
        }
        let label = Label {
            id: format!("label_{}", state.labels.len() + 1),
            name: name.to_string(),
            system: false,
        };
        state.labels.push(label.clone());
        Ok(label)
    }

    async fn modify_message(&self, user: &User, id: &str, add: &[String], remove: &[String]) -> Result<(), ProviderError> {
        self.batch_modify(user, std::slice::from_ref(&id.to_string()), add, remove).await
    }

    async fn batch_modify(&self, user: &User, ids: &[String], add: &[String], remove: &[String]) -> Result<(), ProviderError> {
        let mut users = self.users.lock();
        let state = users.entry(user.id).or_default();
        for id in ids {
            if let Some(message) = state.messages.get_mut(id) {
                message.label_ids.retain(|l| !remove.contains(l));
                for label in add {
                    if !message.label_ids.contains(label) {
                        message.label_ids.push(label.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn start_watch(&self, user: &User, topic: Option<&str>, _label_filter: Option<&str>) -> Result<WatchHandle, ProviderError> {
        self.users.lock().entry(user.id).or_default().watch_active = true;
        Ok(WatchHandle {
            topic: topic.map(str::to_string),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn stop_watch(&self, user: &User) -> Result<(), ProviderError> {
        if let Some(state) = self.users.lock().get_mut(&user.id) {
            state.watch_active = false;
        }
        Ok(())
    }

    async fn get_history(&self, user: &User, since_cursor: &str) -> Result<Vec<HistoryEvent>, ProviderError> {
        Ok(self
            .users
            .lock()
            .get(&user.id)
            .map(|s| s.history.iter().filter(|e| e.history_cursor.as_str() > since_cursor).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Credentials, MessageHeaders, Role};

    fn sample_user() -> User {
        User {
            id: UserId(uuid::Uuid::new_v4()),
            email: "crew@example.com".into(),
            credentials: Credentials {
                access_token_ciphertext: vec![],
                refresh_token_ciphertext: vec![],
                expires_at: chrono::Utc::now(),
            },
            role: Role::User,
            active: true,
            auth_expired: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn seeded_message_round_trips_and_labels_apply() {
        let fake = FakeProviderClient::new();
        let user = sample_user();
        fake.seed_message(
            user.id,
            Message {
                message_id: "m1".into(),
                thread_id: "t1".into(),
                headers: MessageHeaders::default(),
                text_body: "hello".into(),
                snippet: "hello".into(),
                attachments: vec![],
                label_ids: vec![],
            },
        );

        let fetched = fake.fetch_message(&user, "m1", true).await.unwrap();
        assert_eq!(fetched.text_body, "hello");

        fake.modify_message(&user, "m1", &["Label_1".to_string()], &[]).await.unwrap();
        assert_eq!(fake.label_ids_for(user.id, "m1"), vec!["Label_1".to_string()]);
    }

    #[tokio::test]
    async fn create_label_is_idempotent_case_insensitive() {
        let fake = FakeProviderClient::new();
        let user = sample_user();
        let a = fake.create_label(&user, "Project: Smith Res").await.unwrap();
        let b = fake.create_label(&user, "project: smith res").await.unwrap();
        assert_eq!(a.id, b.id);
    }
}
