//! First-page document classification.
//!
//! The model sees page 1 and answers `{"document_type": "LABEL"}`. The label
//! must belong to the category's closed set; anything else, including a
//! failed call, becomes `OTHER` with a warning. Classification only enriches
//! the extraction prompt, so it never fails the job except on cancellation.

use crate::config::DocumentCategory;
use crate::error::AnalysisError;
use crate::job::{Job, JobStage};
use crate::output::DocumentType;
use crate::pipeline::continuation::{ContinuationDriver, Transcript};
use crate::pipeline::llm::Turn;
use crate::pipeline::render::PageImage;
use crate::progress::{ProgressEvent, SharedSink};
use crate::prompts;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

static RE_JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

#[derive(Debug, Deserialize)]
struct ClassificationReply {
    document_type: String,
}

/// Read the model's answer into a label allowed for `category`.
///
/// `Err` carries a human-readable reason; callers fall back to `OTHER`.
pub fn parse_classification(text: &str, category: DocumentCategory) -> Result<DocumentType, String> {
    let json = RE_JSON_OBJECT
        .find(text)
        .ok_or_else(|| "reply contained no JSON object".to_string())?;
    let reply: ClassificationReply = serde_json::from_str(json.as_str())
        .map_err(|e| format!("unreadable classification reply: {e}"))?;
    let label = DocumentType::from_label(&reply.document_type)
        .ok_or_else(|| format!("unknown document type '{}'", reply.document_type))?;
    if !prompts::allowed_document_types(category).contains(&label) {
        return Err(format!("document type {label} is not valid for this category"));
    }
    Ok(label)
}

pub struct ClassificationStage {
    driver: ContinuationDriver,
    category: DocumentCategory,
    sink: SharedSink,
}

impl ClassificationStage {
    pub fn new(driver: ContinuationDriver, category: DocumentCategory, sink: SharedSink) -> Self {
        Self {
            driver,
            category,
            sink,
        }
    }

    /// Classify from `first_page` and record the label on `job`.
    pub async fn run(&self, job: &mut Job, first_page: &PageImage) -> Result<DocumentType, AnalysisError> {
        job.advance(JobStage::Classifying);
        self.sink
            .emit(ProgressEvent::progress("Classifying document..."));

        let mut transcript = Transcript::new();
        transcript.push(Turn::user_with_images(
            prompts::classification_prompt(self.category),
            vec![(prompts::page_image_label(first_page.page_num), first_page.clone())],
        ));

        let outcome = match self.driver.drive(None, &mut transcript).await {
            Ok(completion) => {
                job.stats.model_calls += completion.rounds as u64;
                job.stats.total_input_tokens += completion.input_tokens;
                job.stats.total_output_tokens += completion.output_tokens;
                parse_classification(&completion.text, self.category)
            }
            Err(e) if e.is_cancelled() => return Err(AnalysisError::Cancelled),
            Err(e) => Err(format!("classification call failed: {e}")),
        };

        let document_type = outcome.unwrap_or_else(|reason| {
            warn!("Job {}: {}; using OTHER", job.id, reason);
            self.sink.emit(ProgressEvent::warning(format!(
                "Could not classify document ({reason}); continuing as OTHER"
            )));
            DocumentType::Other
        });

        info!("Job {}: classified as {}", job.id, document_type);
        job.document_type = Some(document_type);
        self.sink.emit(ProgressEvent::progress(format!(
            "Document classified as {document_type}"
        )));
        Ok(document_type)
    }
}
