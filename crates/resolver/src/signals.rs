//! Weighted signal scoring (spec §4.7). Each signal contributes its fixed
//! weight to a candidate project's score if — and only if — it matches;
//! the total is then scaled by the extractor's `overall_confidence`.

use std::collections::HashSet;

use extractor::schema::ExtractedEntities;
use types::{LearningPattern, PatternKind, Project, ProjectId};

pub const W_ADDRESS: f64 = 0.45;
pub const W_JOB_NUMBER: f64 = 0.35;
pub const W_THREAD: f64 = 0.30;
pub const W_NAME: f64 = 0.25;
pub const W_CLIENT: f64 = 0.15;
pub const W_SIMILARITY: f64 = 0.10;

/// Fixed bonus a sender/address learning pattern adds on top of the raw
/// signal weight (spec §4.7 "learning pattern adjustments").
pub const LEARNING_PATTERN_BONUS: f64 = 0.10;

#[derive(Debug, Clone, Default)]
pub struct SignalBreakdown {
    pub address: bool,
    pub job_number: bool,
    pub thread_consensus: bool,
    pub name_or_alias: bool,
    pub client_email: bool,
    pub similarity: bool,
    pub pattern_bonus: f64,
}

impl SignalBreakdown {
    pub fn raw_weight_sum(&self) -> f64 {
        let mut sum = 0.0;
        if self.address {
            sum += W_ADDRESS;
        }
        if self.job_number {
            sum += W_JOB_NUMBER;
        }
        if self.thread_consensus {
            sum += W_THREAD;
        }
        if self.name_or_alias {
            sum += W_NAME;
        }
        if self.client_email {
            sum += W_CLIENT;
        }
        if self.similarity {
            sum += W_SIMILARITY;
        }
        (sum + self.pattern_bonus).min(1.0)
    }
}

fn normalize_loose(s: &str) -> String {
    Project::normalize_name(s)
}

fn address_matches(candidate: &Project, extracted: &extractor::schema::AddressCandidate) -> bool {
    let Some(candidate_addr) = &candidate.address else {
        return false;
    };
    let street_match = match (&candidate_addr.street, &extracted.street) {
        (Some(a), Some(b)) => normalize_loose(a) == normalize_loose(b),
        _ => false,
    };
    let postcode_match = match (&candidate_addr.postcode, &extracted.postcode) {
        (Some(a), Some(b)) => a.trim() == b.trim(),
        _ => false,
    };
    let full_match = normalize_loose(&candidate_addr.full) == normalize_loose(&extracted.full) && !extracted.full.is_empty();
    street_match || full_match || (postcode_match && candidate_addr.street.is_some())
}

fn job_number_matches(candidate: &Project, entities: &ExtractedEntities) -> bool {
    entities
        .job_numbers
        .iter()
        .any(|j| candidate.job_numbers.contains(j.value.trim()))
}

fn client_email_matches(candidate: &Project, entities: &ExtractedEntities) -> bool {
    match (&candidate.client.email, &entities.client.email) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => false,
    }
}

/// Signal 4: exact name/alias match, or a partial (substring) match that
/// an active `Alias` learning pattern promotes to full weight (spec
/// §4.7 "learning pattern adjustments").
fn name_or_alias_matches(candidate: &Project, entities: &ExtractedEntities, patterns: &[&LearningPattern]) -> bool {
    let Some(name) = &entities.project_name else {
        return false;
    };
    if candidate.matches_name_or_alias(&name.value) {
        return true;
    }
    let candidate_normalized = normalize_loose(&name.value);
    patterns.iter().any(|p| {
        p.kind == PatternKind::Alias
            && p.project_id == candidate.id
            && (candidate_normalized.contains(&normalize_loose(&p.pattern_body)) || normalize_loose(&p.pattern_body).contains(&candidate_normalized))
    })
}

fn pattern_bonus(candidate_id: &ProjectId, sender_email: Option<&str>, address_full: Option<&str>, patterns: &[&LearningPattern]) -> f64 {
    let sender_bonus = sender_email.map_or(false, |email| {
        patterns.iter().any(|p| p.kind == PatternKind::SenderToProject && p.project_id == *candidate_id && p.pattern_body.eq_ignore_ascii_case(email.trim()))
    });
    let address_bonus = address_full.map_or(false, |addr| {
        patterns
            .iter()
            .any(|p| p.kind == PatternKind::AddressToProject && p.project_id == *candidate_id && normalize_loose(&p.pattern_body) == normalize_loose(addr))
    });
    if sender_bonus || address_bonus {
        LEARNING_PATTERN_BONUS
    } else {
        0.0
    }
}

/// Scores one candidate project against the extracted entities.
/// `include_thread_bonus` lets the caller compute the "own signals only"
/// score used to detect a thread split (spec §4.7).
pub fn score_candidate(
    candidate: &Project,
    entities: &ExtractedEntities,
    thread_consensus: Option<&ProjectId>,
    include_thread_bonus: bool,
    similarity_score: Option<f64>,
    patterns: &[LearningPattern],
) -> SignalBreakdown {
    let patterns_for_user: Vec<&LearningPattern> = patterns.iter().filter(|p| p.active).collect();

    let address = entities.address.as_ref().map_or(false, |a| address_matches(candidate, a));
    let job_number = job_number_matches(candidate, entities);
    let thread_consensus_match = include_thread_bonus && thread_consensus.map_or(false, |id| id == &candidate.id);
    let name_or_alias = name_or_alias_matches(candidate, entities, &patterns_for_user);
    let client_email = client_email_matches(candidate, entities);
    let similarity = similarity_score.map_or(false, |s| s >= 0.8);

    let sender_email = entities.client.email.as_deref();
    let address_full = entities.address.as_ref().map(|a| a.full.as_str());
    let bonus = pattern_bonus(&candidate.id, sender_email, address_full, &patterns_for_user);

    SignalBreakdown {
        address,
        job_number,
        thread_consensus: thread_consensus_match,
        name_or_alias,
        client_email,
        similarity,
        pattern_bonus: bonus,
    }
}

/// Final blended score (spec §4.7 "Score = sum(matched weights) ×
/// overall_confidence").
pub fn blended_score(breakdown: &SignalBreakdown, overall_confidence: f64) -> f64 {
    (breakdown.raw_weight_sum() * overall_confidence).clamp(0.0, 1.0)
}

pub fn unique_thread_consensus(thread_projects: &HashSet<ProjectId>) -> Option<ProjectId> {
    if thread_projects.len() == 1 {
        thread_projects.iter().next().cloned()
    } else {
        None
    }
}
