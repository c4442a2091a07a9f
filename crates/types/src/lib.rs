//! Shared data model (spec §3). No behaviour lives here — just the
//! durable shapes every other crate passes around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque per-tenant identifier. Wraps a UUID rather than exposing the
/// mail provider's own account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable opaque project identifier. A string, not a UUID, because §4.7's
/// tie-break rule ("smaller project_id lexicographically") only makes
/// sense for an ordered, printable id — ULIDs are used in practice so
/// that the lexicographic order also tracks creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ProjectId {
    pub fn new() -> Self {
        Self(ulid_like(Utc::now()))
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

/// Millisecond-timestamp-prefixed id, so ids sort lexicographically in
/// creation order without a round-trip to the store. Not a real ULID
/// implementation (no Crockford base32 monotonicity guard) — good enough
/// for tie-breaking, not claimed to be collision-proof under clock skew.
fn ulid_like(now: DateTime<Utc>) -> String {
    format!(
        "{:013x}{}",
        now.timestamp_millis().max(0),
        uuid::Uuid::new_v4().simple()
    )
}

/// A real in [0, 1]. Not a probability (see GLOSSARY) — a blended score.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Confidence(f64);

impl Confidence {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self(0.0)
    }
}

impl std::ops::Add for Confidence {
    type Output = Confidence;
    fn add(self, rhs: Confidence) -> Confidence {
        Confidence::new(self.0 + rhs.0)
    }
}

impl std::ops::Mul<f64> for Confidence {
    type Output = Confidence;
    fn mul(self, rhs: f64) -> Confidence {
        Confidence::new(self.0 * rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    User,
    Viewer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Encrypted at rest by the store layer; this is ciphertext, never
    /// the plaintext token.
    pub access_token_ciphertext: Vec<u8>,
    pub refresh_token_ciphertext: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub credentials: Credentials,
    pub role: Role,
    pub active: bool,
    /// Set by the provider client on AuthExpired (spec §7); cleared only
    /// by a fresh consent flow, which is out of the core's scope.
    pub auth_expired: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectStatus {
    Active,
    Completed,
    OnHold,
    Archived,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub full: String,
    pub street: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub postcode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub user_id: UserId,
    pub name: String,
    /// Case-folded, de-duplicated aliases. Does not include `name` itself.
    pub aliases: BTreeSet<String>,
    pub address: Option<Address>,
    pub job_numbers: BTreeSet<String>,
    pub client: ClientContact,
    pub status: ProjectStatus,
    pub email_count: u64,
    pub last_email_at: Option<DateTime<Utc>>,
    pub creation_confidence: Confidence,
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Case-fold + collapse whitespace + strip punctuation, per §4.7
    /// signal 4's matching rule. Shared so the resolver and the store's
    /// alias index normalize identically.
    pub fn normalize_name(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut last_was_space = false;
        for ch in raw.chars() {
            if ch.is_alphanumeric() {
                out.extend(ch.to_lowercase());
                last_was_space = false;
            } else if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        }
        out.trim().to_string()
    }

    pub fn matches_name_or_alias(&self, candidate: &str) -> bool {
        let candidate = Self::normalize_name(candidate);
        if candidate.is_empty() {
            return false;
        }
        Self::normalize_name(&self.name) == candidate
            || self.aliases.iter().any(|a| Self::normalize_name(a) == candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationMethod {
    Auto,
    Ai,
    Similarity,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailProjectMapping {
    pub message_id: String,
    pub thread_id: String,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub confidence: Confidence,
    pub association_method: AssociationMethod,
    pub primary: bool,
    pub active: bool,
    pub needs_review: bool,
    pub split_from_thread: bool,
    pub reflection_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Push,
    Poll,
    Retro,
}

/// Transient — lives only in the notification queue until resolved or
/// dead-lettered (spec §3 "MessageEvent (transient)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub user_id: UserId,
    pub message_id: String,
    pub thread_id: String,
    pub history_cursor: String,
    pub arrival_time: DateTime<Utc>,
    pub source: EventSource,
    pub delivery_attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressPair {
    pub name: Option<String>,
    pub mailbox: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub from: Option<AddressPair>,
    pub to: Vec<AddressPair>,
    pub cc: Vec<AddressPair>,
    pub bcc: Vec<AddressPair>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentCategory {
    Document,
    Spreadsheet,
    Image,
    Drawing,
    Archive,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub provider_attachment_id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub message_id: String,
    pub user_id: UserId,
    pub provider_attachment_id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub category: AttachmentCategory,
    /// Weak reference: resolved when the owning message is resolved,
    /// re-resolved if the message is re-assigned (spec §3).
    pub project_id: Option<ProjectId>,
    pub blob_ref: Option<String>,
}

/// Derived, best-effort projection of a provider message. Bodies are
/// held only for the duration of one processing attempt — this struct
/// is never persisted verbatim (spec §3).
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub thread_id: String,
    pub headers: MessageHeaders,
    pub text_body: String,
    pub snippet: String,
    pub attachments: Vec<AttachmentDescriptor>,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionType {
    Assign,
    Unassign,
    Merge,
    Split,
    Rename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub correction_type: CorrectionType,
    pub original_result: serde_json::Value,
    pub corrected_result: serde_json::Value,
    pub message_id: Option<String>,
    pub project_id: Option<ProjectId>,
    pub reason: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    Alias,
    SenderToProject,
    AddressToProject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningPattern {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub kind: PatternKind,
    /// e.g. the alias text, the `sender@domain`, or the normalized address.
    pub pattern_body: String,
    pub project_id: ProjectId,
    pub confidence: Confidence,
    pub usage_count: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchKind {
    Push,
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSubscription {
    pub user_id: UserId,
    pub topic: Option<String>,
    pub history_cursor: String,
    pub expires_at: DateTime<Utc>,
    pub kind: WatchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

/// The §7 error taxonomy, shared across crates so queue workers can
/// dispatch on `kind()` without downcasting concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    RateLimited,
    AuthExpired,
    ExtractionParse,
    ResolverConflict,
    PersistenceConflict,
    FatalConfig,
}

impl ErrorKind {
    /// Whether a queue worker should retry (`fail(retryable=true)`) or
    /// dead-letter immediately (spec §7 "Propagation policy").
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_name_folds_case_and_punctuation() {
        assert_eq!(
            Project::normalize_name("Smith  Res.  (2024)!"),
            "smith res 2024"
        );
    }

    #[test]
    fn confidence_clamps() {
        assert_eq!(Confidence::new(1.4).value(), 1.0);
        assert_eq!(Confidence::new(-0.2).value(), 0.0);
    }

    #[test]
    fn project_id_orders_lexicographically_by_creation() {
        let a = ProjectId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ProjectId::new();
        assert!(a.0 < b.0);
    }
}
