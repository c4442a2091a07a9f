//! C8 — idempotent label application back to the provider (spec §4.8).
//!
//! Grounded on the teacher's own `crates/imap`/`crates/jmap` "system
//! folder/flag" handling: never delete a system label, batch writes
//! where the wire protocol allows it. The rate limiting and system-label
//! refusal already live inside `provider::batch_modify` — this crate
//! only adds the find-or-create label cache, the `reflection_pending`
//! bookkeeping and the batching-by-`batch_max` chunking spec §4.8 asks
//! for.

pub mod error;

use std::sync::Arc;

use provider::ProviderClient;
use store::Store;
use types::{EmailProjectMapping, Project, User};

pub use error::LabelError;

/// Spec §4.8 "Project: <name>" label naming.
pub fn project_label_name(project: &Project) -> String {
    format!("Project: {}", project.name)
}

#[derive(Debug, Clone, Copy)]
pub struct LabelReflectorConfig {
    pub batch_max: usize,
}

impl Default for LabelReflectorConfig {
    fn default() -> Self {
        Self { batch_max: 100 }
    }
}

pub struct LabelReflector<P> {
    store: Arc<Store>,
    provider: Arc<P>,
    config: LabelReflectorConfig,
}

impl<P: ProviderClient> LabelReflector<P> {
    pub fn new(store: Arc<Store>, provider: Arc<P>, config: LabelReflectorConfig) -> Self {
        Self { store, provider, config }
    }

    /// Find-or-create, case-insensitive (spec §4.8 "never creates
    /// duplicates, case-insensitive match").
    pub async fn ensure_label(&self, user: &User, name: &str) -> Result<String, LabelError> {
        let existing = self.provider.list_labels(user).await?;
        if let Some(found) = existing.iter().find(|l| l.name.eq_ignore_ascii_case(name)) {
            return Ok(found.id.clone());
        }
        let created = self.provider.create_label(user, name).await?;
        Ok(created.id)
    }

    /// Applies a single mapping's project label to its message, clearing
    /// `reflection_pending` on success. The caller is responsible for
    /// leaving the flag set (it already is, by default) if this errors —
    /// the scheduler's reconciliation pass will retry later.
    pub async fn reflect_mapping(&self, user: &User, mapping: &EmailProjectMapping, project: &Project) -> Result<(), LabelError> {
        let label_id = self.ensure_label(user, &project_label_name(project)).await?;
        self.provider.modify_message(user, &mapping.message_id, std::slice::from_ref(&label_id), &[]).await?;
        self.store.set_reflection_pending(user.id, &mapping.message_id, &project.id, false).await?;
        tracing::info!(context = "labels", event = "reflected", message_id = %mapping.message_id, project_id = %project.id, "Applied project label.");
        Ok(())
    }

    /// Applies a label to every message in a thread in one pass,
    /// chunked to `batch_max` per provider call (spec §4.8).
    pub async fn apply_thread(&self, user: &User, thread_id: &str, project: &Project) -> Result<(), LabelError> {
        let label_id = self.ensure_label(user, &project_label_name(project)).await?;
        let mappings = self.store.list_thread_mappings(user.id, thread_id).await?;
        let message_ids: Vec<String> = mappings.into_iter().map(|m| m.message_id).collect();

        for chunk in message_ids.chunks(self.config.batch_max) {
            self.provider.batch_modify(user, chunk, std::slice::from_ref(&label_id), &[]).await?;
        }
        Ok(())
    }

    /// Removes a label from one message. System labels are refused by
    /// `provider` itself; this call surfaces that refusal unchanged.
    pub async fn remove(&self, user: &User, message_id: &str, label_id: &str) -> Result<(), LabelError> {
        self.provider.modify_message(user, message_id, &[], std::slice::from_ref(&label_id.to_string())).await?;
        Ok(())
    }

    /// Reconciliation pass (spec §4.8): re-attempts label application
    /// for every mapping still flagged `reflection_pending`. Individual
    /// failures are logged and left pending rather than aborting the
    /// whole batch.
    pub async fn reconcile_pending(&self, user: &User, limit: i64) -> Result<usize, LabelError> {
        let pending = self.store.list_reflection_pending(user.id, limit).await?;
        let mut reconciled = 0;
        for mapping in pending {
            let Some(project) = self.store.get_project(user.id, &mapping.project_id).await? else {
                continue;
            };
            match self.reflect_mapping(user, &mapping, &project).await {
                Ok(()) => reconciled += 1,
                Err(e) => {
                    tracing::warn!(context = "labels", event = "reconcile-failed", message_id = %mapping.message_id, error = %e, "Reconciliation attempt failed, leaving pending.");
                }
            }
        }
        Ok(reconciled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provider::fake::FakeProviderClient;
    use types::{AssociationMethod, ClientContact, Confidence, Credentials, MessageHeaders, ProjectId, ProjectStatus, Role, UserId};
    use std::collections::BTreeSet;

    fn sample_user() -> User {
        User {
            id: UserId(uuid::Uuid::new_v4()),
            email: "crew@example.com".into(),
            credentials: Credentials { access_token_ciphertext: vec![], refresh_token_ciphertext: vec![], expires_at: chrono::Utc::now() },
            role: Role::User,
            active: true,
            auth_expired: false,
            created_at: chrono::Utc::now(),
        }
    }

    fn sample_project(user_id: UserId) -> Project {
        let now = chrono::Utc::now();
        Project {
            id: ProjectId::new(),
            user_id,
            name: "Smith Residence".into(),
            aliases: BTreeSet::new(),
            address: None,
            job_numbers: BTreeSet::new(),
            client: ClientContact::default(),
            status: ProjectStatus::Active,
            email_count: 0,
            last_email_at: None,
            creation_confidence: Confidence::new(0.9),
            needs_review: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn test_store() -> Arc<Store> {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn ensure_label_is_idempotent_and_applies_to_message() {
        let store = test_store().await;
        let provider = Arc::new(FakeProviderClient::new());
        let user = sample_user();
        let project = sample_project(user.id);
        store.create_project(&project).await.unwrap();

        provider.seed_message(
            user.id,
            types::Message {
                message_id: "m1".into(),
                thread_id: "t1".into(),
                headers: MessageHeaders::default(),
                text_body: String::new(),
                snippet: String::new(),
                attachments: vec![],
                label_ids: vec![],
            },
        );

        let reflector = LabelReflector::new(store.clone(), provider.clone(), LabelReflectorConfig::default());
        let now = chrono::Utc::now();
        let mapping = EmailProjectMapping {
            message_id: "m1".into(),
            thread_id: "t1".into(),
            user_id: user.id,
            project_id: project.id.clone(),
            confidence: Confidence::new(0.9),
            association_method: AssociationMethod::Auto,
            primary: true,
            active: true,
            needs_review: false,
            split_from_thread: false,
            reflection_pending: true,
            created_at: now,
            updated_at: now,
        };
        store.resolve_message(&mapping).await.unwrap();

        reflector.reflect_mapping(&user, &mapping, &project).await.unwrap();

        let label_id_first = reflector.ensure_label(&user, "Project: Smith Residence").await.unwrap();
        let label_id_second = reflector.ensure_label(&user, "project: smith residence").await.unwrap();
        assert_eq!(label_id_first, label_id_second);

        let applied = provider.label_ids_for(user.id, "m1");
        assert_eq!(applied, vec![label_id_first]);

        let refreshed = store.get_active_mapping(user.id, "m1").await.unwrap().unwrap();
        assert!(!refreshed.reflection_pending);
    }

    #[tokio::test]
    async fn reconcile_pending_clears_flag_once_reachable() {
        let store = test_store().await;
        let provider = Arc::new(FakeProviderClient::new());
        let user = sample_user();
        let project = sample_project(user.id);
        store.create_project(&project).await.unwrap();

        provider.seed_message(
            user.id,
            types::Message {
                message_id: "m2".into(),
                thread_id: "t2".into(),
                headers: MessageHeaders::default(),
                text_body: String::new(),
                snippet: String::new(),
                attachments: vec![],
                label_ids: vec![],
            },
        );

        let now = chrono::Utc::now();
        let mapping = EmailProjectMapping {
            message_id: "m2".into(),
            thread_id: "t2".into(),
            user_id: user.id,
            project_id: project.id.clone(),
            confidence: Confidence::new(0.9),
            association_method: AssociationMethod::Auto,
            primary: true,
            active: true,
            needs_review: false,
            split_from_thread: false,
            reflection_pending: true,
            created_at: now,
            updated_at: now,
        };
        store.resolve_message(&mapping).await.unwrap();

        let reflector = LabelReflector::new(store.clone(), provider.clone(), LabelReflectorConfig::default());
        let reconciled = reflector.reconcile_pending(&user, 10).await.unwrap();
        assert_eq!(reconciled, 1);

        let pending = store.list_reflection_pending(user.id, 10).await.unwrap();
        assert!(pending.is_empty());
    }
}
