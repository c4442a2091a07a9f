//! C2 — typed wrapper over the upstream mail provider API (spec §4.2).
//!
//! Grounded on the teacher's own provider-facing HTTP client shape: the
//! `imap`/`smtp` crates each wrap a remote protocol behind a typed
//! client with retry baked in; here that becomes a single `reqwest`
//! client plus the retry/backoff loop the teacher runs in
//! `crates/smtp/src/queue/throttle.rs` (structured `tracing` events on
//! every refusal, not silent retry). MIME walking reuses `mail-parser`,
//! the crate the teacher's own `email`/`jmap` crates already depend on
//! for the same job.

pub mod error;
pub mod fake;
mod mime;

use async_trait::async_trait;
use rand::Rng;
use ratelimit::{BucketKind, Decision, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use types::{Message, User};

pub use error::ProviderError;
pub use mime::parse_mime_message;

#[derive(Debug, Clone)]
pub struct ProfileInfo {
    pub email: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery<'a> {
    pub query: Option<&'a str>,
    pub cursor: Option<&'a str>,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
pub struct ListPage {
    pub message_ids: Vec<String>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub system: bool,
}

#[derive(Debug, Clone)]
pub struct WatchHandle {
    pub topic: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct HistoryEvent {
    pub message_id: String,
    pub thread_id: String,
    pub history_cursor: String,
}

/// Out-of-scope collaborator (spec §1): the concrete upstream mail API is
/// not named by the core; every call site programs against this trait.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn profile(&self, user: &User) -> Result<ProfileInfo, ProviderError>;
    async fn list_messages(&self, user: &User, query: ListQuery<'_>) -> Result<ListPage, ProviderError>;
    async fn fetch_message(&self, user: &User, id: &str, include_body: bool) -> Result<Message, ProviderError>;
    async fn list_labels(&self, user: &User) -> Result<Vec<Label>, ProviderError>;
    async fn create_label(&self, user: &User, name: &str) -> Result<Label, ProviderError>;
    async fn modify_message(&self, user: &User, id: &str, add: &[String], remove: &[String]) -> Result<(), ProviderError>;
    async fn batch_modify(&self, user: &User, ids: &[String], add: &[String], remove: &[String]) -> Result<(), ProviderError>;
    async fn start_watch(&self, user: &User, topic: Option<&str>, label_filter: Option<&str>) -> Result<WatchHandle, ProviderError>;
    async fn stop_watch(&self, user: &User) -> Result<(), ProviderError>;
    async fn get_history(&self, user: &User, since_cursor: &str) -> Result<Vec<HistoryEvent>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Gmail-shaped HTTP implementation. `base_url` is overridable for tests
/// against a mock server; production wiring points it at the real API.
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpProviderClient {
    pub fn new(base_url: impl Into<String>, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            limiter,
            retry,
        }
    }

    /// Gates the call through C1, then retries transient failures with
    /// exponential backoff + jitter (spec §4.2). `401` is handled by the
    /// caller, which holds the credential-refresh logic this generic
    /// helper does not know about.
    async fn with_retry<T, F, Fut>(&self, user: &User, kind: BucketKind, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match self.limiter.acquire(user.id, kind) {
                Decision::Ok => {}
                Decision::RetryAfterMs(ms) => return Err(ProviderError::RateLimited { retry_after_ms: ms }),
            }

            match tokio::time::timeout(self.retry.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(ProviderError::Transient(msg))) if attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = backoff_with_jitter(self.retry.base_delay, attempt);
                    tracing::warn!(
                        context = "provider",
                        event = "transient-retry",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "Provider call failed, retrying."
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    if attempt + 1 < self.retry.max_attempts {
                        attempt += 1;
                        continue;
                    }
                    return Err(ProviderError::Transient("call timed out".into()));
                }
            }
        }
    }
}

fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=exp.min(u128::from(u64::MAX)) as u64 / 4 + 1);
    Duration::from_millis(exp.min(u128::from(u64::MAX)) as u64 + jitter)
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn profile(&self, user: &User) -> Result<ProfileInfo, ProviderError> {
        self.with_retry(user, BucketKind::Read, || async {
            let url = format!("{}/profile", self.base_url);
            let resp = authorized(&self.http, &url, user).send().await.map_err(map_reqwest_err)?;
            let resp = check_status(resp).await?;
            let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
            Ok(ProfileInfo {
                email: body.get("emailAddress").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            })
        })
        .await
    }

    async fn list_messages(&self, user: &User, query: ListQuery<'_>) -> Result<ListPage, ProviderError> {
        let page_size = query.page_size.max(1);
        let q = query.query.map(str::to_string);
        let cursor = query.cursor.map(str::to_string);
        self.with_retry(user, BucketKind::Read, || async {
            let mut req = authorized(&self.http, &format!("{}/messages", self.base_url), user).query(&[("maxResults", page_size.to_string())]);
            if let Some(q) = &q {
                req = req.query(&[("q", q)]);
            }
            if let Some(cursor) = &cursor {
                req = req.query(&[("pageToken", cursor)]);
            }
            let resp = req.send().await.map_err(map_reqwest_err)?;
            let resp = check_status(resp).await?;
            let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
            let message_ids = body
                .get("messages")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|m| m.get("id").and_then(|v| v.as_str()).map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let next_cursor = body.get("nextPageToken").and_then(|v| v.as_str()).map(str::to_string);
            Ok(ListPage { message_ids, next_cursor })
        })
        .await
    }

    async fn fetch_message(&self, user: &User, id: &str, include_body: bool) -> Result<Message, ProviderError> {
        self.with_retry(user, BucketKind::Read, || async {
            let format = if include_body { "full" } else { "metadata" };
            let url = format!("{}/messages/{}", self.base_url, id);
            let resp = authorized(&self.http, &url, user).query(&[("format", format)]).send().await.map_err(map_reqwest_err)?;
            let resp = check_status(resp).await?;
            let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
            mime::message_from_provider_json(id, &body)
        })
        .await
    }

    async fn list_labels(&self, user: &User) -> Result<Vec<Label>, ProviderError> {
        self.with_retry(user, BucketKind::Read, || async {
            let resp = authorized(&self.http, &format!("{}/labels", self.base_url), user).send().await.map_err(map_reqwest_err)?;
            let resp = check_status(resp).await?;
            let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
            Ok(body
                .get("labels")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| {
                            Some(Label {
                                id: l.get("id")?.as_str()?.to_string(),
                                name: l.get("name")?.as_str()?.to_string(),
                                system: l.get("type").and_then(|v| v.as_str()) == Some("system"),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
        .await
    }

    async fn create_label(&self, user: &User, name: &str) -> Result<Label, ProviderError> {
        self.with_retry(user, BucketKind::Write, || async {
            let resp = authorized(&self.http, &format!("{}/labels", self.base_url), user)
                .json(&serde_json::json!({ "name": name }))
                .send()
                .await
                .map_err(map_reqwest_err)?;
            let resp = check_status(resp).await?;
            let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
            Ok(Label {
                id: body.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                name: name.to_string(),
                system: false,
            })
        })
        .await
    }

    async fn modify_message(&self, user: &User, id: &str, add: &[String], remove: &[String]) -> Result<(), ProviderError> {
        self.batch_modify(user, std::slice::from_ref(&id.to_string()), add, remove).await
    }

    async fn batch_modify(&self, user: &User, ids: &[String], add: &[String], remove: &[String]) -> Result<(), ProviderError> {
        if guard_system_label_removal(remove) {
            return Err(ProviderError::Parse("refusing to remove a system label".into()));
        }
        self.with_retry(user, BucketKind::Write, || async {
            let resp = authorized(&self.http, &format!("{}/messages/batchModify", self.base_url), user)
                .json(&serde_json::json!({ "ids": ids, "addLabelIds": add, "removeLabelIds": remove }))
                .send()
                .await
                .map_err(map_reqwest_err)?;
            check_status(resp).await?;
            Ok(())
        })
        .await
    }

    async fn start_watch(&self, user: &User, topic: Option<&str>, label_filter: Option<&str>) -> Result<WatchHandle, ProviderError> {
        let topic = topic.map(str::to_string);
        let label_filter = label_filter.map(str::to_string);
        self.with_retry(user, BucketKind::Write, || async {
            let resp = authorized(&self.http, &format!("{}/watch", self.base_url), user)
                .json(&serde_json::json!({ "topicName": topic, "labelIds": label_filter }))
                .send()
                .await
                .map_err(map_reqwest_err)?;
            let resp = check_status(resp).await?;
            let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
            let expiration_ms: i64 = body.get("expiration").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0);
            Ok(WatchHandle {
                topic: topic.clone(),
                expires_at: chrono::DateTime::from_timestamp_millis(expiration_ms).unwrap_or_else(chrono::Utc::now),
            })
        })
        .await
    }

    async fn stop_watch(&self, user: &User) -> Result<(), ProviderError> {
        self.with_retry(user, BucketKind::Write, || async {
            let resp = authorized(&self.http, &format!("{}/stop", self.base_url), user).send().await.map_err(map_reqwest_err)?;
            check_status(resp).await?;
            Ok(())
        })
        .await
    }

    async fn get_history(&self, user: &User, since_cursor: &str) -> Result<Vec<HistoryEvent>, ProviderError> {
        let cursor = since_cursor.to_string();
        self.with_retry(user, BucketKind::Read, || async {
            let resp = authorized(&self.http, &format!("{}/history", self.base_url), user)
                .query(&[("startHistoryId", &cursor)])
                .send()
                .await
                .map_err(map_reqwest_err)?;
            let resp = check_status(resp).await?;
            let body: serde_json::Value = resp.json().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
            Ok(mime::history_events_from_json(&body))
        })
        .await
    }
}

/// Credential decryption is a store-layer concern out of this crate's
/// scope; by the time a `User` reaches here its token bytes are already
/// plaintext and ready to present as a bearer token.
fn authorized(http: &reqwest::Client, url: &str, user: &User) -> reqwest::RequestBuilder {
    http.get(url).bearer_auth(String::from_utf8_lossy(&user.credentials.access_token_ciphertext))
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 429 {
        let retry_after_ms = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(ProviderError::RateLimited { retry_after_ms });
    }
    if status.as_u16() == 401 {
        return Err(ProviderError::AuthExpired);
    }
    if status.as_u16() == 403 {
        return Err(ProviderError::QuotaExceeded);
    }
    if status.is_server_error() {
        return Err(ProviderError::Transient(format!("http {status}")));
    }
    Err(ProviderError::Parse(format!("unexpected status {status}")))
}

fn map_reqwest_err(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::Transient(err.to_string())
    } else {
        ProviderError::Transient(err.to_string())
    }
}

/// Rotates a user's access token, persisting the new ciphertext. Kept as
/// a trait so `provider` does not depend on `store` directly — `main`
/// wires a `store`-backed implementation at boot.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, user: &mut User) -> Result<(), ProviderError>;
}

/// Wraps any `ProviderClient`, refreshing the token once on an expiring
/// or already-expired credential before retrying the call — spec §4.2's
/// "if the access token has ≤60s life remaining, or a call returns 401,
/// refresh once then retry; a second 401 surfaces as AuthExpired".
pub struct RefreshingProviderClient<P, R> {
    inner: P,
    refresher: R,
}

impl<P, R> RefreshingProviderClient<P, R>
where
    P: ProviderClient,
    R: TokenRefresher,
{
    pub fn new(inner: P, refresher: R) -> Self {
        Self { inner, refresher }
    }

    async fn with_refresh<T, F, Fut>(&self, user: &User, call: F) -> Result<T, ProviderError>
    where
        F: Fn(User) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let near_expiry = user.credentials.expires_at - chrono::Utc::now() <= chrono::Duration::seconds(60);
        let mut user = user.clone();
        if near_expiry {
            self.refresher.refresh(&mut user).await?;
        }
        match call(user.clone()).await {
            Err(ProviderError::AuthExpired) => {
                self.refresher.refresh(&mut user).await?;
                match call(user).await {
                    Err(ProviderError::AuthExpired) => Err(ProviderError::AuthExpired),
                    other => other,
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl<P, R> ProviderClient for RefreshingProviderClient<P, R>
where
    P: ProviderClient,
    R: TokenRefresher,
{
    async fn profile(&self, user: &User) -> Result<ProfileInfo, ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.profile(&u).await }).await
    }

    async fn list_messages(&self, user: &User, query: ListQuery<'_>) -> Result<ListPage, ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.list_messages(&u, query.clone()).await }).await
    }

    async fn fetch_message(&self, user: &User, id: &str, include_body: bool) -> Result<Message, ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.fetch_message(&u, id, include_body).await }).await
    }

    async fn list_labels(&self, user: &User) -> Result<Vec<Label>, ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.list_labels(&u).await }).await
    }

    async fn create_label(&self, user: &User, name: &str) -> Result<Label, ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.create_label(&u, name).await }).await
    }

    async fn modify_message(&self, user: &User, id: &str, add: &[String], remove: &[String]) -> Result<(), ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.modify_message(&u, id, add, remove).await }).await
    }

    async fn batch_modify(&self, user: &User, ids: &[String], add: &[String], remove: &[String]) -> Result<(), ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.batch_modify(&u, ids, add, remove).await }).await
    }

    async fn start_watch(&self, user: &User, topic: Option<&str>, label_filter: Option<&str>) -> Result<WatchHandle, ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.start_watch(&u, topic, label_filter).await }).await
    }

    async fn stop_watch(&self, user: &User) -> Result<(), ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.stop_watch(&u).await }).await
    }

    async fn get_history(&self, user: &User, since_cursor: &str) -> Result<Vec<HistoryEvent>, ProviderError> {
        self.with_refresh(user, |u| async move { self.inner.get_history(&u, since_cursor).await }).await
    }
}

/// System labels (`INBOX`, `SENT`, `TRASH`, …) are refused for removal,
/// per spec §4.8.
fn guard_system_label_removal(remove: &[String]) -> bool {
    const SYSTEM_LABELS: &[&str] = &["INBOX", "SENT", "DRAFT", "TRASH", "SPAM", "UNREAD", "STARRED"];
    remove.iter().any(|l| SYSTEM_LABELS.contains(&l.to_uppercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_system_label_removal() {
        assert!(guard_system_label_removal(&["INBOX".to_string()]));
        assert!(!guard_system_label_removal(&["Label_123".to_string()]));
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let first = backoff_with_jitter(Duration::from_millis(100), 0);
        let second = backoff_with_jitter(Duration::from_millis(100), 3);
        assert!(second >= first);
    }
}
