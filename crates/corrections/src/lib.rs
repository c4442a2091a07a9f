//! C9 — append-only correction log plus the slow-cadence learning pass
//! that turns repeated corrections into `LearningPattern`s (spec §4.9).
//!
//! Grounded on the teacher's own audit-log-then-derive-policy shape in
//! `crates/directory` (auth events logged once, then folded into
//! lockout/rate decisions on a later pass) — corrections are never
//! rewritten in place, only read forward into a derived pattern.

pub mod error;

use std::sync::Arc;

use store::Store;
use types::{Confidence, Correction, CorrectionType, LearningPattern, PatternKind, Project, ProjectId, UserId};

pub use error::CorrectionError;

/// Optional structured hints a caller may attach to `Correction::corrected_result`
/// when the correction implies a learnable signal. Absent fields mean "no
/// signal of that kind" rather than "unknown" — the pass never guesses
/// (spec §4.9 "when the signal is ambiguous, no pattern is emitted").
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CorrectionHints {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

const INITIAL_PATTERN_CONFIDENCE: f64 = 0.5;
const PATTERN_CONFIDENCE_STEP: f64 = 0.1;

/// Spec §4.9's "repeated assign-to-project-X ... yields an alias
/// pattern" default — a single correction must not yet bias resolution.
pub const DEFAULT_MIN_SUPPORT: u32 = 3;

pub struct CorrectionStore {
    store: Arc<Store>,
    min_support: u32,
}

impl CorrectionStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_min_support(store, DEFAULT_MIN_SUPPORT)
    }

    /// `min_support` is `jt-config`'s `learning_pattern_min_support`
    /// (spec line 237) — a pattern only becomes `active` (and therefore
    /// visible to the resolver, see `resolver/src/signals.rs`) once its
    /// usage count reaches this threshold.
    pub fn with_min_support(store: Arc<Store>, min_support: u32) -> Self {
        Self { store, min_support: min_support.max(1) }
    }

    /// Appends one correction (spec §4.9 "on write: snapshot current
    /// state, record new state, set processed=false").
    pub async fn record(&self, correction: &Correction) -> Result<(), CorrectionError> {
        Ok(self.store.append_correction(correction).await?)
    }

    /// Runs the learning pass over every unprocessed correction for one
    /// user, deriving or reinforcing `LearningPattern`s. Returns how many
    /// corrections were processed.
    pub async fn process_unprocessed(&self, user_id: UserId) -> Result<usize, CorrectionError> {
        let unprocessed = self.store.list_unprocessed_corrections(user_id).await?;
        let mut processed = 0;

        for correction in &unprocessed {
            self.derive_patterns(correction).await?;
            self.store.mark_correction_processed(correction.id).await?;
            processed += 1;
        }

        Ok(processed)
    }

    async fn derive_patterns(&self, correction: &Correction) -> Result<(), CorrectionError> {
        let Some(project_id) = &correction.project_id else {
            // No target project: nothing to attribute a pattern to.
            return Ok(());
        };

        let hints: CorrectionHints = serde_json::from_value(correction.corrected_result.clone()).unwrap_or_default();

        match correction.correction_type {
            CorrectionType::Assign => {
                if let Some(alias) = &hints.alias {
                    self.bump_pattern(correction.user_id, PatternKind::Alias, alias, project_id).await?;
                }
                if let Some(email) = &hints.sender_email {
                    self.bump_pattern(correction.user_id, PatternKind::SenderToProject, email, project_id).await?;
                }
                if let Some(address) = &hints.address {
                    self.bump_pattern(correction.user_id, PatternKind::AddressToProject, address, project_id).await?;
                }
            }
            CorrectionType::Rename => {
                // A rename implies the old name lives on as an alias.
                if let Some(alias) = &hints.alias {
                    self.bump_pattern(correction.user_id, PatternKind::Alias, alias, project_id).await?;
                }
            }
            // Unassign/Merge/Split don't imply a single unambiguous
            // (kind, body) → project signal on their own.
            CorrectionType::Unassign | CorrectionType::Merge | CorrectionType::Split => {}
        }

        Ok(())
    }

    fn normalize(kind: PatternKind, raw: &str) -> String {
        match kind {
            PatternKind::SenderToProject => raw.trim().to_lowercase(),
            PatternKind::Alias | PatternKind::AddressToProject => Project::normalize_name(raw),
        }
    }

    async fn bump_pattern(&self, user_id: UserId, kind: PatternKind, raw_body: &str, project_id: &ProjectId) -> Result<(), CorrectionError> {
        let body = Self::normalize(kind, raw_body);
        if body.is_empty() {
            return Ok(());
        }

        let existing = self
            .store
            .list_all_patterns(user_id)
            .await?
            .into_iter()
            .find(|p| p.kind == kind && p.project_id == *project_id && p.pattern_body == body);

        let mut pattern = match existing {
            Some(mut found) => {
                found.usage_count += 1;
                found.confidence = Confidence::new((found.confidence.value() + PATTERN_CONFIDENCE_STEP).min(1.0));
                found
            }
            None => LearningPattern {
                id: uuid::Uuid::new_v4(),
                user_id,
                kind,
                pattern_body: body,
                project_id: project_id.clone(),
                confidence: Confidence::new(INITIAL_PATTERN_CONFIDENCE),
                usage_count: 1,
                active: false,
                created_at: chrono::Utc::now(),
            },
        };
        // Spec §4.9: a pattern only biases resolution once it has been
        // reinforced `min_support` times.
        pattern.active = pattern.usage_count >= self.min_support;

        tracing::info!(context = "corrections", event = "pattern-bump", kind = ?pattern.kind, usage_count = pattern.usage_count, "Learning pattern reinforced.");
        Ok(self.store.upsert_learning_pattern(&pattern).await?)
    }

    /// Merges `source` into `target` (spec §4.9 "Merge"): mappings
    /// re-pointed, attachments re-pointed, target's `email_count`
    /// recomputed, source archived. All handled transactionally by
    /// `Store::merge_projects`.
    pub async fn merge_projects(&self, user_id: UserId, source: &ProjectId, target: &ProjectId) -> Result<(), CorrectionError> {
        Ok(self.store.merge_projects(user_id, source, target).await?)
    }

    /// Splits one message off `source` onto a brand new project (spec
    /// §4.9 "Split": counters on both sides recomputed via `resolve_message`'s
    /// transactional update on the new project; `source`'s own counters
    /// are left for the caller to recompute from its remaining mappings).
    pub async fn split_message(&self, user_id: UserId, message_id: &str, new_project: &Project) -> Result<(), CorrectionError> {
        Ok(self.store.split_mapping_onto_project(user_id, message_id, new_project).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use types::{ClientContact, ProjectStatus};

    async fn test_store() -> Arc<Store> {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Arc::new(store)
    }

    fn sample_project(user_id: UserId, name: &str) -> Project {
        let now = chrono::Utc::now();
        Project {
            id: ProjectId::new(),
            user_id,
            name: name.into(),
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

    fn assign_correction(user_id: UserId, project_id: &ProjectId, hints: CorrectionHints) -> Correction {
        Correction {
            id: uuid::Uuid::new_v4(),
            user_id,
            correction_type: CorrectionType::Assign,
            original_result: serde_json::json!({}),
            corrected_result: serde_json::to_value(hints).unwrap(),
            message_id: Some("m1".into()),
            project_id: Some(project_id.clone()),
            reason: "user override".into(),
            processed: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn single_correction_does_not_yet_activate_pattern() {
        let store = test_store().await;
        let corrections = CorrectionStore::new(store.clone());
        let user_id = UserId(uuid::Uuid::new_v4());
        let project = sample_project(user_id, "Smith Residence");
        store.create_project(&project).await.unwrap();

        let hints = CorrectionHints { alias: Some("Smith Res".into()), sender_email: None, address: None };
        corrections.record(&assign_correction(user_id, &project.id, hints)).await.unwrap();
        corrections.process_unprocessed(user_id).await.unwrap();

        assert!(store.list_active_patterns(user_id).await.unwrap().is_empty());
        let all = store.list_all_patterns(user_id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].usage_count, 1);
        assert!(!all[0].active);
    }

    #[tokio::test]
    async fn repeated_alias_correction_reinforces_one_pattern_until_it_activates() {
        let store = test_store().await;
        let corrections = CorrectionStore::with_min_support(store.clone(), 2);
        let user_id = UserId(uuid::Uuid::new_v4());
        let project = sample_project(user_id, "Smith Residence");
        store.create_project(&project).await.unwrap();

        let hints = CorrectionHints { alias: Some("Smith Res".into()), sender_email: None, address: None };
        corrections.record(&assign_correction(user_id, &project.id, hints.clone())).await.unwrap();
        corrections.process_unprocessed(user_id).await.unwrap();
        assert!(store.list_active_patterns(user_id).await.unwrap().is_empty());

        corrections.record(&assign_correction(user_id, &project.id, hints)).await.unwrap();
        corrections.process_unprocessed(user_id).await.unwrap();

        let patterns = store.list_active_patterns(user_id).await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].usage_count, 2);
        assert!(patterns[0].confidence.value() > INITIAL_PATTERN_CONFIDENCE);
    }

    #[tokio::test]
    async fn unassign_correction_yields_no_pattern() {
        let store = test_store().await;
        let corrections = CorrectionStore::new(store.clone());
        let user_id = UserId(uuid::Uuid::new_v4());
        let project = sample_project(user_id, "Smith Residence");
        store.create_project(&project).await.unwrap();

        let correction = Correction {
            id: uuid::Uuid::new_v4(),
            user_id,
            correction_type: CorrectionType::Unassign,
            original_result: serde_json::json!({}),
            corrected_result: serde_json::json!({}),
            message_id: Some("m1".into()),
            project_id: Some(project.id.clone()),
            reason: "wrong project".into(),
            processed: false,
            created_at: chrono::Utc::now(),
        };
        corrections.record(&correction).await.unwrap();
        corrections.process_unprocessed(user_id).await.unwrap();

        assert!(store.list_active_patterns(user_id).await.unwrap().is_empty());
    }
}
