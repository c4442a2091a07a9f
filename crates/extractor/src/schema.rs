//! Entity/similarity schemas (spec §4.5). Kept as plain serde structs so
//! both the vendor-backed extractor and the deterministic stub produce
//! (and `validate` checks) exactly the same shape.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameCandidate {
    pub value: String,
    pub confidence: f64,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressCandidate {
    pub full: String,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobNumberSource {
    Subject,
    Body,
    Signature,
    AttachmentFilename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNumberCandidate {
    pub value: String,
    pub source: JobNumberSource,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCandidate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub project_name: Option<NameCandidate>,
    /// Additional independent project-name candidates beyond the primary
    /// one (spec §4.7 "multiple independent project_name candidates with
    /// confidence ≥0.6"). Empty for the common single-project case.
    #[serde(default)]
    pub alternate_project_names: Vec<NameCandidate>,
    #[serde(default)]
    pub address: Option<AddressCandidate>,
    #[serde(default)]
    pub job_numbers: Vec<JobNumberCandidate>,
    #[serde(default)]
    pub client: ClientCandidate,
    /// Free-form — the spec leaves the variant set open ("project_type:
    /// enum?"); kept as an opaque tag rather than inventing a closed enum.
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub overall_confidence: f64,
}

impl ExtractedEntities {
    /// A message with multiple independent high-confidence project-name
    /// candidates is treated as a multi-project email (spec §4.7); the
    /// schema only carries one `project_name`, so callers pass extra
    /// candidates via `alternate_project_names`.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.overall_confidence) {
            return Err(format!("overall_confidence {} out of range", self.overall_confidence));
        }
        if let Some(name) = &self.project_name {
            if !(0.0..=1.0).contains(&name.confidence) {
                return Err(format!("project_name.confidence {} out of range", name.confidence));
            }
        }
        if let Some(addr) = &self.address {
            if !(0.0..=1.0).contains(&addr.confidence) {
                return Err(format!("address.confidence {} out of range", addr.confidence));
            }
        }
        for j in &self.job_numbers {
            if !(0.0..=1.0).contains(&j.confidence) {
                return Err(format!("job_number.confidence {} out of range", j.confidence));
            }
        }
        if !(0.0..=1.0).contains(&self.client.confidence) {
            return Err(format!("client.confidence {} out of range", self.client.confidence));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingIndicators {
    pub project_name: bool,
    pub address: bool,
    pub job_number: bool,
    pub client: bool,
    pub content: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub same_project: bool,
    pub score: f64,
    pub matching_indicators: MatchingIndicators,
    pub reason: String,
}

impl SimilarityResult {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.score) {
            return Err(format!("score {} out of range", self.score));
        }
        Ok(())
    }
}
