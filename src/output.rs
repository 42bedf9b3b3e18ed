//! Result types produced by the pipeline.
//!
//! Everything here is `Serialize + Deserialize`: page records travel inside
//! `batch_complete` progress events, and the whole [`AnalysisResult`] is what
//! the job store keeps for post-hoc retrieval.

use crate::job::JobStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `page_type` given to a page the model never produced output for.
pub const UNKNOWN_PAGE_TYPE: &str = "Unknown";
/// `content` given to a page the model never produced output for.
pub const NO_ANALYSIS_FOUND: &str = "No analysis found.";
/// `page_type` given to every page of a batch whose model call failed.
pub const ERROR_PAGE_TYPE: &str = "Error";

/// Extracted data for one page.
///
/// Written once by the extraction stage and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    /// 1-indexed page number, unique within a job.
    pub page_num: usize,
    /// Free-text classification of the page ("Pharmacy Report-Continued").
    pub page_type: String,
    /// Free-text extracted body.
    pub content: String,
}

impl PageRecord {
    pub fn new(page_num: usize, page_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            page_num,
            page_type: page_type.into(),
            content: content.into(),
        }
    }

    /// Stand-in for a page the model skipped.
    pub fn placeholder(page_num: usize) -> Self {
        Self::new(page_num, UNKNOWN_PAGE_TYPE, NO_ANALYSIS_FOUND)
    }

    /// Stand-in for a page whose batch failed; `reason` is the failure.
    pub fn error(page_num: usize, reason: impl Into<String>) -> Self {
        Self::new(page_num, ERROR_PAGE_TYPE, reason)
    }

    pub fn is_error(&self) -> bool {
        self.page_type == ERROR_PAGE_TYPE
    }

    pub fn is_placeholder(&self) -> bool {
        self.page_type == UNKNOWN_PAGE_TYPE && self.content == NO_ANALYSIS_FOUND
    }
}

/// The cross-page underwriter assessment.
///
/// Fixed shape: every field is always present. Fields the model did not
/// (yet) fill are empty strings; fields that could not be recovered carry an
/// `"Error: …"` explanation instead of being dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisResult {
    #[serde(rename = "RISK_ASSESSMENT")]
    pub risk_assessment: String,
    #[serde(rename = "DISCREPANCIES")]
    pub discrepancies: String,
    #[serde(rename = "MEDICAL_TIMELINE")]
    pub timeline: String,
    #[serde(rename = "FINAL_RECOMMENDATION")]
    pub final_recommendation: String,
}

impl SynthesisResult {
    /// JSON keys the model must emit, in display order.
    pub const REQUIRED_KEYS: [&'static str; 4] = [
        "RISK_ASSESSMENT",
        "DISCREPANCIES",
        "MEDICAL_TIMELINE",
        "FINAL_RECOMMENDATION",
    ];

    /// Result where every field explains why nothing usable was produced.
    pub fn error_placeholder(reason: &str) -> Self {
        let msg = format!("Error: {reason}");
        Self {
            risk_assessment: msg.clone(),
            discrepancies: msg.clone(),
            timeline: msg.clone(),
            final_recommendation: msg,
        }
    }

    /// Field value by its JSON key.
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "RISK_ASSESSMENT" => Some(&self.risk_assessment),
            "DISCREPANCIES" => Some(&self.discrepancies),
            "MEDICAL_TIMELINE" => Some(&self.timeline),
            "FINAL_RECOMMENDATION" => Some(&self.final_recommendation),
            _ => None,
        }
    }

    pub(crate) fn field_mut(&mut self, key: &str) -> Option<&mut String> {
        match key {
            "RISK_ASSESSMENT" => Some(&mut self.risk_assessment),
            "DISCREPANCIES" => Some(&mut self.discrepancies),
            "MEDICAL_TIMELINE" => Some(&mut self.timeline),
            "FINAL_RECOMMENDATION" => Some(&mut self.final_recommendation),
            _ => None,
        }
    }

    /// Keys whose value is an `"Error: …"` placeholder.
    pub fn error_fields(&self) -> Vec<&'static str> {
        Self::REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|k| self.field(k).is_some_and(|v| v.starts_with("Error")))
            .collect()
    }

    /// Keys that held content in `previous` but are blank in `self`.
    ///
    /// Refinement is supposed to only extend the assessment; this surfaces
    /// rounds where the model dropped a section instead.
    pub fn regressions_from(&self, previous: &SynthesisResult) -> Vec<&'static str> {
        Self::REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|k| {
                let before = previous.field(k).unwrap_or_default().trim();
                let after = self.field(k).unwrap_or_default().trim();
                !before.is_empty() && !before.starts_with("Error") && after.is_empty()
            })
            .collect()
    }
}

/// Closed set of document labels returned by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    LifeInsuranceApplication,
    MedicalReport,
    AttendingPhysicianStatement,
    LabReport,
    PrescriptionHistory,
    FinancialStatement,
    AcordForm,
    CommercialPropertyApplication,
    CrimeReport,
    Other,
}

impl DocumentType {
    /// Wire label, e.g. `MEDICAL_REPORT`.
    pub fn label(&self) -> &'static str {
        match self {
            DocumentType::LifeInsuranceApplication => "LIFE_INSURANCE_APPLICATION",
            DocumentType::MedicalReport => "MEDICAL_REPORT",
            DocumentType::AttendingPhysicianStatement => "ATTENDING_PHYSICIAN_STATEMENT",
            DocumentType::LabReport => "LAB_REPORT",
            DocumentType::PrescriptionHistory => "PRESCRIPTION_HISTORY",
            DocumentType::FinancialStatement => "FINANCIAL_STATEMENT",
            DocumentType::AcordForm => "ACORD_FORM",
            DocumentType::CommercialPropertyApplication => "COMMERCIAL_PROPERTY_APPLICATION",
            DocumentType::CrimeReport => "CRIME_REPORT",
            DocumentType::Other => "OTHER",
        }
    }

    /// Parse a wire label, tolerating case and surrounding whitespace.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalised = label.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Self::ALL.iter().copied().find(|t| t.label() == normalised)
    }

    pub const ALL: [DocumentType; 10] = [
        DocumentType::LifeInsuranceApplication,
        DocumentType::MedicalReport,
        DocumentType::AttendingPhysicianStatement,
        DocumentType::LabReport,
        DocumentType::PrescriptionHistory,
        DocumentType::FinancialStatement,
        DocumentType::AcordForm,
        DocumentType::CommercialPropertyApplication,
        DocumentType::CrimeReport,
        DocumentType::Other,
    ];
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Counters collected while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStats {
    /// Pages analysed (after any page limit).
    pub total_pages: usize,
    /// Pages whose record came from parsed model output.
    pub extracted_pages: usize,
    /// Pages filled with the "No analysis found" placeholder.
    pub placeholder_pages: usize,
    /// Pages stamped with an `Error` record.
    pub error_pages: usize,
    /// Extraction batches that failed outright.
    pub failed_batches: usize,
    /// Synthesis refinement rounds completed.
    pub synthesis_rounds: usize,
    /// Physical model calls, continuations included.
    pub model_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub extraction_duration_ms: u64,
    pub synthesis_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Post-hoc view of a job: what `get_result` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub job_id: String,
    pub status: JobStatus,
    pub document_type: Option<DocumentType>,
    /// Every page 1..=N, ascending.
    pub pages: BTreeMap<usize, PageRecord>,
    pub synthesis: Option<SynthesisResult>,
    pub error: Option<String>,
    pub stats: AnalysisStats,
}
