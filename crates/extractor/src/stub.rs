//! Deterministic stub extractor (SPEC_FULL §4 "Deterministic-Stub-for-tests").
//! No network, no LLM — regex-driven heuristics good enough to exercise
//! the resolver's scoring logic in tests without depending on a vendor.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use types::Message;

use crate::error::ExtractorError;
use crate::schema::{AddressCandidate, ClientCandidate, ExtractedEntities, JobNumberCandidate, JobNumberSource, MatchingIndicators, NameCandidate, SimilarityResult};
use crate::{EntityExtractor, ExtractionContext};

static JOB_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bjob\s*#?\s*(\d{3,7})\b").unwrap());
static POSTCODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{4,5})\b").unwrap());
static STREET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(\d+\s+[A-Za-z][A-Za-z\s]{2,30}(?:street|st|road|rd|avenue|ave|drive|dr|lane|ln))\b").unwrap());
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap());

#[derive(Debug, Clone, Default)]
pub struct StubEntityExtractor;

impl StubEntityExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EntityExtractor for StubEntityExtractor {
    async fn extract(&self, ctx: ExtractionContext<'_>) -> Result<ExtractedEntities, ExtractorError> {
        let subject = ctx.message.headers.subject.clone().unwrap_or_default();
        let haystack = format!("{subject}\n{}", ctx.message.text_body);

        let project_name = ctx
            .existing_project_hints
            .iter()
            .find(|hint| haystack.to_lowercase().contains(&hint.to_lowercase()))
            .cloned()
            .or_else(|| extract_title_like(&subject))
            .map(|value| NameCandidate { value, confidence: 0.7, aliases: Vec::new() });

        let street = STREET_RE.captures(&haystack).map(|c| c[1].trim().to_string());
        let postcode = POSTCODE_RE.captures(&haystack).map(|c| c[1].to_string());
        let address = street.clone().map(|street| AddressCandidate {
            full: street.clone(),
            street: Some(street),
            locality: None,
            region: None,
            postcode,
            confidence: 0.65,
        });

        let job_numbers: Vec<JobNumberCandidate> = JOB_NUMBER_RE
            .captures_iter(&haystack)
            .map(|c| JobNumberCandidate {
                value: c[1].to_string(),
                source: if subject.contains(&c[1]) { JobNumberSource::Subject } else { JobNumberSource::Body },
                confidence: 0.8,
            })
            .collect();

        let sender_email = ctx.message.headers.from.as_ref().map(|f| f.mailbox.clone());
        let client_email = EMAIL_RE.find(&haystack).map(|m| m.as_str().to_string()).or(sender_email.clone());
        let client = ClientCandidate {
            name: ctx.message.headers.from.as_ref().and_then(|f| f.name.clone()),
            email: client_email,
            phone: None,
            company: None,
            confidence: 0.6,
        };

        let overall_confidence = [
            project_name.as_ref().map(|n| n.confidence),
            address.as_ref().map(|a| a.confidence),
            job_numbers.first().map(|j| j.confidence),
        ]
        .into_iter()
        .flatten()
        .fold(0.0_f64, f64::max)
        .max(0.3);

        Ok(ExtractedEntities {
            project_name,
            address,
            job_numbers,
            client,
            project_type: None,
            keywords: Vec::new(),
            overall_confidence,
        })
    }

    async fn compare(&self, a: &Message, b: &Message) -> Result<SimilarityResult, ExtractorError> {
        let subject_a = a.headers.subject.clone().unwrap_or_default().to_lowercase();
        let subject_b = b.headers.subject.clone().unwrap_or_default().to_lowercase();
        let content_match = !subject_a.is_empty() && subjects_share_topic(&subject_a, &subject_b);

        let indicators = MatchingIndicators {
            project_name: false,
            address: false,
            job_number: false,
            client: a.headers.from.as_ref().map(|f| &f.mailbox) == b.headers.from.as_ref().map(|f| &f.mailbox),
            content: content_match,
        };
        let score = if content_match { 0.75 } else { 0.2 };
        Ok(SimilarityResult {
            same_project: score >= 0.8,
            score,
            matching_indicators: indicators,
            reason: "stub heuristic comparison of subject and sender".into(),
        })
    }
}

fn extract_title_like(subject: &str) -> Option<String> {
    let cleaned = subject.trim_start_matches("Re:").trim_start_matches("RE:").trim_start_matches("Fwd:").trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn subjects_share_topic(a: &str, b: &str) -> bool {
    let strip = |s: &str| s.trim_start_matches("re:").trim_start_matches("fwd:").trim().to_string();
    strip(a) == strip(b) && !strip(a).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{AddressPair, MessageHeaders};

    fn message(subject: &str, body: &str, from: &str) -> Message {
        Message {
            message_id: "m1".into(),
            thread_id: "t1".into(),
            headers: MessageHeaders {
                from: Some(AddressPair { name: Some("Client".into()), mailbox: from.into() }),
                to: vec![],
                cc: vec![],
                bcc: vec![],
                subject: Some(subject.into()),
                date: None,
            },
            text_body: body.into(),
            snippet: body.chars().take(50).collect(),
            attachments: vec![],
            label_ids: vec![],
        }
    }

    #[tokio::test]
    async fn extracts_job_number_and_address_from_body() {
        let extractor = StubEntityExtractor::new();
        let msg = message("Job #4521 update", "Please see 42 Wallaby Way, postcode 4000 for the deck plans. Job 4521.", "client@example.com");
        let result = extractor.extract(ExtractionContext { message: &msg, existing_project_hints: &[] }).await.unwrap();
        result.validate().unwrap();
        assert_eq!(result.job_numbers[0].value, "4521");
        assert!(result.address.is_some());
    }

    #[tokio::test]
    async fn compare_flags_matching_subject_as_same_project() {
        let extractor = StubEntityExtractor::new();
        let a = message("Smith Residence Update", "body a", "client@example.com");
        let b = message("Re: Smith Residence Update", "body b", "client@example.com");
        let result = extractor.compare(&a, &b).await.unwrap();
        result.validate().unwrap();
        assert!(result.score > 0.5);
    }
}
