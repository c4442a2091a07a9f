//! C5 — prompted entity extraction and pairwise similarity (spec §4.5).
//! The concrete language model vendor is explicitly out of scope (spec
//! §1); every call site programs against `EntityExtractor`. Grounded on
//! the teacher's own `nlp` crate's "stateless transform, explicit
//! context in" shape rather than any hidden conversation/session state.

pub mod error;
pub mod schema;
pub mod stub;

use async_trait::async_trait;
use types::Message;

pub use error::ExtractorError;
pub use schema::{ExtractedEntities, SimilarityResult};

#[derive(Debug, Clone, Default)]
pub struct ExtractionContext<'a> {
    pub message: &'a Message,
    /// Existing project names/aliases for this user, passed in explicitly
    /// per spec §4.5 "any context is passed in explicitly" — the
    /// extractor itself holds no session state between calls.
    pub existing_project_hints: &'a [String],
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<ExtractedEntities, ExtractorError>;
    async fn compare(&self, a: &Message, b: &Message) -> Result<SimilarityResult, ExtractorError>;
}

#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout: std::time::Duration,
}

/// Vendor-backed extractor. Any HTTP endpoint that accepts a JSON prompt
/// and returns JSON matching `schema::ExtractedEntities`/`SimilarityResult`
/// can sit behind this — the concrete vendor is configuration
/// (`ai_provider`/`ai_model`), never a code path (spec §4.5).
pub struct HttpEntityExtractor {
    http: reqwest::Client,
    config: VendorConfig,
}

impl HttpEntityExtractor {
    pub fn new(config: VendorConfig) -> Self {
        Self { http: reqwest::Client::new(), config }
    }

    /// Spec §4.5: "at most 2 [reformatting] retries, each with a
    /// stricter reformatting preamble; after that, dead-letter."
    async fn call_with_reformat_retries<T, F>(&self, prompt: &serde_json::Value, validate: F) -> Result<T, ExtractorError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&T) -> Result<(), String>,
    {
        let mut last_err = String::new();
        for attempt in 0..=2u32 {
            let mut body = prompt.clone();
            if attempt > 0 {
                body["strict_reformat"] = serde_json::Value::Bool(true);
                body["reformat_attempt"] = serde_json::Value::from(attempt);
            }

            let response = tokio::time::timeout(self.config.timeout, self.http.post(&self.config.endpoint).json(&body).send())
                .await
                .map_err(|_| ExtractorError::Transient("extractor call timed out".into()))?
                .map_err(|e| ExtractorError::Transient(e.to_string()))?;

            if !response.status().is_success() {
                if response.status().is_server_error() {
                    return Err(ExtractorError::Transient(format!("http {}", response.status())));
                }
                last_err = format!("http {}", response.status());
                continue;
            }

            let raw: serde_json::Value = response.json().await.map_err(|e| ExtractorError::Transient(e.to_string()))?;
            match serde_json::from_value::<T>(raw.clone()) {
                Ok(parsed) => match validate(&parsed) {
                    Ok(()) => return Ok(parsed),
                    Err(reason) => {
                        tracing::warn!(context = "extractor", event = "schema-reject", attempt, reason = %reason, "Extractor output failed validation.");
                        last_err = reason;
                    }
                },
                Err(e) => {
                    tracing::warn!(context = "extractor", event = "parse-failure", attempt, error = %e, "Extractor output did not deserialize.");
                    last_err = e.to_string();
                }
            }
        }
        Err(ExtractorError::Parse(last_err))
    }
}

#[async_trait]
impl EntityExtractor for HttpEntityExtractor {
    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<ExtractedEntities, ExtractorError> {
        let prompt = serde_json::json!({
            "model": self.config.model,
            "task": "extract",
            "subject": ctx.message.headers.subject,
            "body": ctx.message.text_body,
            "sender": ctx.message.headers.from.as_ref().map(|f| &f.mailbox),
            "existing_project_hints": ctx.existing_project_hints,
        });
        self.call_with_reformat_retries(&prompt, |e: &ExtractedEntities| e.validate()).await
    }

    async fn compare(&self, a: &Message, b: &Message) -> Result<SimilarityResult, ExtractorError> {
        let prompt = serde_json::json!({
            "model": self.config.model,
            "task": "compare",
            "message_a": { "subject": a.headers.subject, "body": a.text_body },
            "message_b": { "subject": b.headers.subject, "body": b.text_body },
        });
        self.call_with_reformat_retries(&prompt, |s: &SimilarityResult| s.validate()).await
    }
}
