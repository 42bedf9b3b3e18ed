//! Synthesis stage: fold page records into one underwriter assessment.
//!
//! The model keeps a single conversation for the whole stage. A seed turn
//! fixes the JSON shape, then every group of `R` records (ascending page
//! order) is sent as a refinement turn carrying the previous reply and the
//! new page summaries. Each reply's last `<output>` block, once parsed,
//! becomes the current result.
//!
//! Failure handling per round:
//!
//! * unparseable reply: keep the previous result, warn, go on;
//! * failed model call: roll the transcript back to before the turn, warn,
//!   and fold the same records into the next round;
//! * cancellation: abort.
//!
//! Only a failed seed is fatal. The transcript grows with every round, so a
//! round ceiling and a transcript-size ceiling force early finalisation with
//! the best result so far.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::job::{Job, JobStage};
use crate::output::{PageRecord, SynthesisResult};
use crate::pipeline::batch::batch_items;
use crate::pipeline::checkpoint;
use crate::pipeline::continuation::{Completion, ContinuationDriver, Transcript};
use crate::pipeline::llm::{ModelTier, Turn};
use crate::pipeline::parse::{first_tag, parse_synthesis, SynthesisParse};
use crate::progress::{ProgressEvent, SharedSink};
use crate::prompts;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Knobs of the synthesis stage, lifted from [`AnalysisConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisSettings {
    /// Records per refinement round (R).
    pub batch_size: usize,
    pub max_rounds: usize,
    pub max_transcript_chars: usize,
    pub focus_updates: bool,
    pub focus_max_tokens: usize,
}

impl SynthesisSettings {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            batch_size: config.synthesis_batch_size,
            max_rounds: config.max_synthesis_rounds,
            max_transcript_chars: config.max_transcript_chars,
            focus_updates: config.focus_updates,
            focus_max_tokens: config.focus_max_tokens,
        }
    }
}

/// How a synthesis run went, beyond its result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    pub rounds: usize,
    pub parsed_rounds: usize,
    pub failed_rounds: usize,
    /// A ceiling stopped the run before every record was folded in.
    pub finalized_early: bool,
}

pub struct SynthesisStage {
    driver: ContinuationDriver,
    focus: Option<ContinuationDriver>,
    settings: SynthesisSettings,
    sink: SharedSink,
    store: Arc<dyn JobStore>,
}

impl SynthesisStage {
    pub fn new(
        driver: ContinuationDriver,
        settings: SynthesisSettings,
        sink: SharedSink,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let focus = settings.focus_updates.then(|| {
            driver
                .clone()
                .with_tier(ModelTier::Fast)
                .with_max_tokens(settings.focus_max_tokens)
        });
        Self {
            driver,
            focus,
            settings,
            sink,
            store,
        }
    }

    /// Run the stage over `job.pages` and store the result in `job.synthesis`.
    pub async fn run(&self, job: &mut Job) -> Result<(SynthesisResult, SynthesisReport), AnalysisError> {
        let started = Instant::now();
        let records: Vec<PageRecord> = job.pages.values().cloned().collect();
        let groups = batch_items(&records, self.settings.batch_size, |r| r.page_num)?;
        let total_rounds = groups.len();
        let mut report = SynthesisReport::default();

        info!(
            "Job {}: synthesising {} records in {} rounds of up to {}",
            job.id,
            records.len(),
            total_rounds,
            self.settings.batch_size
        );

        // ── Seed ─────────────────────────────────────────────────────────
        job.advance(JobStage::Synthesizing { round: 0 });
        self.sink
            .emit(ProgressEvent::progress("Starting underwriter analysis..."));

        let mut transcript = Transcript::new();
        transcript.push(Turn::user(prompts::synthesis_seed_prompt(
            self.settings.batch_size,
        )));
        let seed = self.driver.drive(None, &mut transcript).await.map_err(|e| {
            warn!("Job {}: synthesis seed failed: {}", job.id, e);
            AnalysisError::from(e)
        })?;
        record_usage(job, &seed);

        let seed_parse = parse_synthesis(&seed.text);
        let mut current_text = seed.text;
        let mut best: Option<SynthesisResult> = None;
        let mut fallback = SynthesisResult::error_placeholder("No output block found");
        checkpoint(self.store.as_ref(), job).await;

        if total_rounds == 0 {
            let result = seed_parse.into_result();
            job.synthesis = Some(result.clone());
            job.stats.synthesis_duration_ms += started.elapsed().as_millis() as u64;
            return Ok((result, report));
        }
        self.report_focus(job, &current_text).await;

        // ── Refinement rounds ────────────────────────────────────────────
        let mut carried: Vec<PageRecord> = Vec::new();
        for (index, (batch, chunk)) in groups.into_iter().enumerate() {
            let round = index + 1;
            let is_last = round == total_rounds;

            if self.driver.cancel_token().is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            if let Some(reason) = self.ceiling_reached(report.rounds, &transcript) {
                warn!("Job {}: {}, finalising synthesis early", job.id, reason);
                self.sink.emit(ProgressEvent::warning(format!(
                    "Synthesis finalised early ({reason}); pages from {} onwards were not folded in",
                    carried.first().map_or(batch.first_page, |r| r.page_num)
                )));
                report.finalized_early = true;
                break;
            }

            job.advance(JobStage::Synthesizing { round });
            let mut pages = std::mem::take(&mut carried);
            pages.extend_from_slice(chunk);
            debug!(
                "Job {}: refinement round {}/{} with {} records",
                job.id,
                round,
                total_rounds,
                pages.len()
            );

            let mark = transcript.checkpoint();
            transcript.push(Turn::user(prompts::synthesis_refine_prompt(
                &current_text,
                &pages,
            )));

            match self.driver.drive(None, &mut transcript).await {
                Ok(completion) => {
                    record_usage(job, &completion);
                    report.rounds += 1;
                    match parse_synthesis(&completion.text) {
                        SynthesisParse::Parsed { result, .. } => {
                            report.parsed_rounds += 1;
                            if let Some(previous) = &best {
                                self.report_regressions(job, round, &result, previous);
                            }
                            best = Some(result);
                            current_text = completion.text;
                        }
                        failed => {
                            self.sink.emit(ProgressEvent::warning(format!(
                                "Round {round} produced no usable assessment; keeping the previous one"
                            )));
                            fallback = failed.into_result();
                            // The next round builds on the last good analysis, not the garbled reply.
                            current_text = match best.as_ref().and_then(analysis_block) {
                                Some(block) => block,
                                None => completion.text,
                            };
                        }
                    }
                }
                Err(e) if e.is_cancelled() => return Err(AnalysisError::Cancelled),
                Err(e) => {
                    transcript.rollback(mark);
                    report.failed_rounds += 1;
                    warn!("Job {}: refinement round {} failed: {}", job.id, round, e);
                    self.sink.emit(ProgressEvent::warning(format!(
                        "Refinement with pages {} to {} failed: {}",
                        pages.first().map_or(batch.first_page, |r| r.page_num),
                        batch.last_page,
                        e
                    )));
                    fallback = SynthesisResult::error_placeholder(&e.to_string());
                    carried = pages;
                    continue;
                }
            }

            job.synthesis = best.clone();
            job.stats.synthesis_rounds = report.rounds;
            checkpoint(self.store.as_ref(), job).await;

            if !is_last {
                self.report_focus(job, &current_text).await;
            }
        }

        if !carried.is_empty() {
            warn!(
                "Job {}: {} records were never folded into the synthesis",
                job.id,
                carried.len()
            );
        }

        let result = best.unwrap_or(fallback);
        job.synthesis = Some(result.clone());
        job.stats.synthesis_rounds = report.rounds;
        job.stats.synthesis_duration_ms += started.elapsed().as_millis() as u64;
        info!(
            "Job {}: synthesis done ({} rounds, {} parsed, {} failed) in {}ms",
            job.id,
            report.rounds,
            report.parsed_rounds,
            report.failed_rounds,
            started.elapsed().as_millis()
        );
        Ok((result, report))
    }

    fn ceiling_reached(&self, rounds: usize, transcript: &Transcript) -> Option<String> {
        if rounds >= self.settings.max_rounds {
            Some(format!("round limit of {} reached", self.settings.max_rounds))
        } else if transcript.char_len() >= self.settings.max_transcript_chars {
            Some(format!(
                "transcript reached {} characters",
                transcript.char_len()
            ))
        } else {
            None
        }
    }

    fn report_regressions(
        &self,
        job: &Job,
        round: usize,
        result: &SynthesisResult,
        previous: &SynthesisResult,
    ) {
        let dropped = result.regressions_from(previous);
        if dropped.is_empty() {
            return;
        }
        warn!("Job {}: round {} emptied {:?}", job.id, round, dropped);
        self.sink.emit(ProgressEvent::warning(format!(
            "Round {round} removed previously reported content from: {}",
            dropped.join(", ")
        )));
    }

    /// Best-effort "current focus" phrase from the reply's `<thinking>`.
    async fn report_focus(&self, job: &mut Job, reply: &str) {
        let Some(focus) = &self.focus else {
            return;
        };
        let Some(thinking) = first_tag(reply, "thinking") else {
            return;
        };

        let mut transcript = Transcript::new();
        transcript.push(Turn::user(prompts::focus_prompt(thinking)));
        match focus.drive(None, &mut transcript).await {
            Ok(completion) => {
                record_usage(job, &completion);
                match first_tag(&completion.text, "output").filter(|s| !s.is_empty()) {
                    Some(phrase) => self.sink.emit(ProgressEvent::progress(phrase)),
                    None => debug!("Job {}: focus reply had no <output>", job.id),
                }
            }
            Err(e) => debug!("Job {}: focus summary skipped: {}", job.id, e),
        }
    }
}

/// `result` rendered the way a parseable reply carries it.
fn analysis_block(result: &SynthesisResult) -> Option<String> {
    serde_json::to_string_pretty(result)
        .ok()
        .map(|json| format!("<output>\n{json}\n</output>"))
}

fn record_usage(job: &mut Job, completion: &Completion) {
    job.stats.model_calls += completion.rounds as u64;
    job.stats.total_input_tokens += completion.input_tokens;
    job.stats.total_output_tokens += completion.output_tokens;
}
