//! Extraction stage: page images → one [`PageRecord`] per page.
//!
//! Batches run strictly in ascending page order. Each batch moves through
//! [`BatchState`]s; a `progress` event is emitted before the model call and a
//! `batch_complete` event after the records are merged.
//!
//! Local recovery rules:
//!
//! * a page the model skipped gets the "Unknown / No analysis found"
//!   placeholder;
//! * a batch whose model call failed gets an `Error` record per page, with
//!   the failure as content, and the stage moves on;
//! * cancellation is never recovered, and neither is a run where every
//!   attempted batch failed.
//!
//! Batches whose pages all already hold non-error records (a resumed job)
//! are skipped without calling the model.

use crate::config::DocumentCategory;
use crate::error::{AnalysisError, ModelError};
use crate::job::{Job, JobStage};
use crate::output::PageRecord;
use crate::pipeline::batch::{batch_items, Batch};
use crate::pipeline::checkpoint;
use crate::pipeline::continuation::{ContinuationDriver, Transcript};
use crate::pipeline::llm::Turn;
use crate::pipeline::parse::parse_page_blocks;
use crate::pipeline::render::PageImage;
use crate::progress::{ProgressEvent, SharedSink};
use crate::prompts;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where one batch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    BuildingPrompt,
    CallingModel,
    Parsing,
    Merged,
    Failed,
    Skipped,
}

/// Summary of one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    pub batches: usize,
    pub skipped_batches: usize,
    pub failed_batches: usize,
    /// Pages that needed a placeholder because the model skipped them.
    pub placeholder_pages: Vec<usize>,
    pub first_error: Option<String>,
}

impl ExtractionReport {
    pub fn attempted_batches(&self) -> usize {
        self.batches - self.skipped_batches
    }
}

struct BatchOutput {
    records: Vec<PageRecord>,
    missing: Vec<usize>,
}

pub struct ExtractionStage {
    driver: ContinuationDriver,
    category: DocumentCategory,
    sink: SharedSink,
    store: Arc<dyn JobStore>,
}

impl ExtractionStage {
    pub fn new(
        driver: ContinuationDriver,
        category: DocumentCategory,
        sink: SharedSink,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            driver,
            category,
            sink,
            store,
        }
    }

    /// Extract every page of `images` into `job.pages`.
    ///
    /// On return `job.pages` holds exactly one record per image.
    pub async fn run(
        &self,
        job: &mut Job,
        images: &[PageImage],
    ) -> Result<ExtractionReport, AnalysisError> {
        let started = Instant::now();
        let groups = batch_items(images, job.options.batch_size, |img| img.page_num)?;
        let mut report = ExtractionReport {
            batches: groups.len(),
            ..Default::default()
        };
        info!(
            "Job {}: extracting {} pages in {} batches of up to {}",
            job.id,
            images.len(),
            groups.len(),
            job.options.batch_size
        );

        for (batch, chunk) in groups {
            if self.driver.cancel_token().is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }

            if already_extracted(job, &batch) {
                self.transition(job, &batch, BatchState::Skipped);
                report.skipped_batches += 1;
                self.sink.emit(ProgressEvent::progress(format!(
                    "Pages {} to {} already extracted, skipping",
                    batch.first_page, batch.last_page
                )));
                continue;
            }

            job.advance(JobStage::Extracting {
                first_page: batch.first_page,
                last_page: batch.last_page,
            });
            self.sink.emit(ProgressEvent::progress(format!(
                "Processing pages {} to {} ...",
                batch.first_page, batch.last_page
            )));

            let records = match self.extract_batch(job, &batch, chunk).await {
                Ok(out) => {
                    if !out.missing.is_empty() {
                        warn!(
                            "Job {}: no output for pages {:?} in batch {}, using placeholders",
                            job.id, out.missing, batch
                        );
                        report.placeholder_pages.extend(&out.missing);
                    }
                    self.transition(job, &batch, BatchState::Merged);
                    out.records
                }
                Err(e) if e.is_cancelled() => return Err(AnalysisError::Cancelled),
                Err(e) => {
                    self.transition(job, &batch, BatchState::Failed);
                    warn!("Job {}: batch {} failed: {}", job.id, batch, e);
                    report.failed_batches += 1;
                    report.first_error.get_or_insert_with(|| e.to_string());
                    self.sink.emit(ProgressEvent::warning(format!(
                        "Pages {} to {} could not be analysed: {}",
                        batch.first_page, batch.last_page, e
                    )));
                    batch
                        .pages()
                        .map(|p| PageRecord::error(p, e.to_string()))
                        .collect()
                }
            };

            for record in &records {
                job.pages.insert(record.page_num, record.clone());
            }
            self.sink.emit(ProgressEvent::batch_complete(
                format!("Completed pages {} to {}", batch.first_page, batch.last_page),
                records,
            ));
            checkpoint(self.store.as_ref(), job).await;
        }

        self.record_stats(job, &report, started);

        let attempted = report.attempted_batches();
        if attempted > 0 && report.failed_batches == attempted {
            return Err(AnalysisError::AllBatchesFailed {
                batches: attempted,
                first_error: report.first_error.clone().unwrap_or_default(),
            });
        }

        info!(
            "Job {}: extraction done ({} batches, {} failed, {} skipped) in {}ms",
            job.id,
            report.batches,
            report.failed_batches,
            report.skipped_batches,
            started.elapsed().as_millis()
        );
        Ok(report)
    }

    async fn extract_batch(
        &self,
        job: &mut Job,
        batch: &Batch,
        chunk: &[PageImage],
    ) -> Result<BatchOutput, ModelError> {
        self.transition(job, batch, BatchState::BuildingPrompt);
        let page_numbers: Vec<usize> = chunk.iter().map(|img| img.page_num).collect();
        let text = prompts::extraction_prompt(self.category, job.document_type, &page_numbers);
        let images = chunk
            .iter()
            .map(|img| (prompts::page_image_label(img.page_num), img.clone()))
            .collect();
        let mut transcript = Transcript::new();
        transcript.push(Turn::user_with_images(text, images));

        self.transition(job, batch, BatchState::CallingModel);
        let completion = self.driver.drive(None, &mut transcript).await?;
        job.stats.model_calls += completion.rounds as u64;
        job.stats.total_input_tokens += completion.input_tokens;
        job.stats.total_output_tokens += completion.output_tokens;

        self.transition(job, batch, BatchState::Parsing);
        let parsed = parse_page_blocks(&completion.text);
        let (records, missing) = parsed.records_for(&page_numbers);
        Ok(BatchOutput { records, missing })
    }

    fn transition(&self, job: &Job, batch: &Batch, state: BatchState) {
        debug!("Job {}: batch {} → {:?}", job.id, batch, state);
    }

    fn record_stats(&self, job: &mut Job, report: &ExtractionReport, started: Instant) {
        let stats = &mut job.stats;
        stats.total_pages = job.pages.len();
        stats.error_pages = job.pages.values().filter(|r| r.is_error()).count();
        stats.placeholder_pages = job.pages.values().filter(|r| r.is_placeholder()).count();
        stats.extracted_pages = stats.total_pages - stats.error_pages - stats.placeholder_pages;
        stats.failed_batches = report.failed_batches;
        stats.extraction_duration_ms += started.elapsed().as_millis() as u64;
    }
}

fn already_extracted(job: &Job, batch: &Batch) -> bool {
    batch
        .pages()
        .all(|p| job.pages.get(&p).is_some_and(|r| !r.is_error()))
}
