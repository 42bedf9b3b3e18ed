//! The job record: everything the pipeline knows about one submission.
//!
//! A [`Job`] is owned exclusively by its worker while running. The worker
//! persists a snapshot after every stage transition so a crashed or cancelled
//! run can be inspected or resumed; page images are never part of the record.

use crate::config::ResolvedOptions;
use crate::output::{AnalysisResult, AnalysisStats, DocumentType, PageRecord, SynthesisResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Where a job is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Rasterizing,
    Classifying,
    /// Working on the extraction batch starting at `first_page`.
    Extracting { first_page: usize, last_page: usize },
    /// Refinement round `round` (0 is the seed).
    Synthesizing { round: usize },
    Complete,
    Failed,
}

/// Externally visible outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Persisted state of one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub stage: JobStage,
    pub status: JobStatus,
    pub options: ResolvedOptions,
    /// Pages actually analysed, known once rasterisation finished.
    pub total_pages: Option<usize>,
    pub document_type: Option<DocumentType>,
    /// Accumulated page records, keyed by page number.
    pub pages: BTreeMap<usize, PageRecord>,
    pub synthesis: Option<SynthesisResult>,
    pub error: Option<String>,
    pub stats: AnalysisStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(options: ResolvedOptions) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            stage: JobStage::Pending,
            status: JobStatus::Pending,
            options,
            total_pages: None,
            document_type: None,
            pages: BTreeMap::new(),
            synthesis: None,
            error: None,
            stats: AnalysisStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `stage`, marking the job as running.
    pub fn advance(&mut self, stage: JobStage) {
        self.stage = stage;
        if !self.status.is_terminal() {
            self.status = JobStatus::Running;
        }
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, synthesis: SynthesisResult) {
        self.synthesis = Some(synthesis);
        self.stage = JobStage::Complete;
        self.status = JobStatus::Complete;
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Terminal failure. Partial pages/synthesis stay on the record.
    pub fn fail(&mut self, reason: impl Into<String>, cancelled: bool) {
        self.stage = JobStage::Failed;
        self.status = if cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Failed
        };
        self.error = Some(reason.into());
        self.updated_at = Utc::now();
    }

    /// Prepare a non-complete job for another run, keeping usable pages.
    ///
    /// Error records are dropped so their batches are retried; parsed and
    /// placeholder records are kept.
    pub fn reset_for_resume(&mut self) {
        self.pages.retain(|_, r| !r.is_error());
        self.stage = JobStage::Pending;
        self.status = JobStatus::Pending;
        self.error = None;
        self.synthesis = None;
        self.updated_at = Utc::now();
    }

    pub fn to_result(&self) -> AnalysisResult {
        AnalysisResult {
            job_id: self.id.to_string(),
            status: self.status,
            document_type: self.document_type,
            pages: self.pages.clone(),
            synthesis: self.synthesis.clone(),
            error: self.error.clone(),
            stats: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ResolvedOptions {
        ResolvedOptions {
            batch_size: 3,
            page_limit: None,
        }
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn lifecycle_sets_status() {
        let mut job = Job::new(opts());
        assert_eq!(job.status, JobStatus::Pending);

        job.advance(JobStage::Extracting {
            first_page: 1,
            last_page: 3,
        });
        assert_eq!(job.status, JobStatus::Running);

        job.complete(SynthesisResult::default());
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn cancelled_failure_is_distinct() {
        let mut job = Job::new(opts());
        job.fail("stopped by user", true);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.stage, JobStage::Failed);
    }

    #[test]
    fn resume_drops_error_pages_only() {
        let mut job = Job::new(opts());
        job.pages.insert(1, PageRecord::new(1, "Application", "Name: J. Doe"));
        job.pages.insert(2, PageRecord::error(2, "timeout"));
        job.pages.insert(3, PageRecord::placeholder(3));
        job.fail("boom", false);

        job.reset_for_resume();
        assert_eq!(job.pages.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
    }

    #[test]
    fn job_serialises_without_images() {
        let job = Job::new(opts());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["stage"]["stage"], "pending");
    }
}
