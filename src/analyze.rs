//! Job orchestration: submit, subscribe, fetch results, cancel, resume.
//!
//! [`Analyzer`] runs every submission on its own Tokio task so the caller is
//! never blocked for the length of the pipeline. The worker owns its [`Job`]
//! exclusively; the outside world sees it only through the progress channel
//! and the snapshots the worker writes to the [`JobStore`].
//!
//! The progress channel is created at submission, before the worker starts,
//! so a subscriber that attaches late still receives every event from the
//! beginning. Each run has exactly one live subscriber; subscribing after the
//! run ended replays only its terminal event, rebuilt from the store.
//!
//! Registry entries live exactly as long as the run. A finished worker drops
//! its handle, its unclaimed channel (unless the final snapshot could not be
//! written, in which case the channel is the only copy of the result) and,
//! last, its running marker.
//!
//! Terminal handling is always persist-then-report: the final snapshot is
//! written before the `complete`/`error` event goes out, and a failed write
//! turns into a `warning` rather than a lost result.

use crate::config::{AnalysisConfig, JobOptions};
use crate::error::AnalysisError;
use crate::job::{Job, JobId, JobStage, JobStatus};
use crate::output::{AnalysisResult, SynthesisResult};
use crate::pipeline::checkpoint;
use crate::pipeline::classify::ClassificationStage;
use crate::pipeline::continuation::{ContinuationDriver, Transcript};
use crate::pipeline::extract::ExtractionStage;
use crate::pipeline::input;
use crate::pipeline::llm::{EdgequakeInvoker, ModelInvoker, Role, Turn};
use crate::pipeline::render::{PdfiumRasterizer, Rasterizer};
use crate::pipeline::synthesize::{SynthesisSettings, SynthesisStage};
use crate::progress::{ChannelReporter, Phase, ProgressEvent, SharedSink};
use crate::prompts;
use crate::store::{InMemoryJobStore, JobStore};
use crate::stream::ProgressStream;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Message of the warning emitted when the final snapshot could not be written.
pub const PERSIST_FAILED_WARNING: &str = "Analysis completed but failed to persist results";

type WorkerHandle = JoinHandle<Result<AnalysisResult, AnalysisError>>;

/// Analyse a local PDF or URL end to end and return the result.
///
/// Uses the edgequake-llm provider resolved from `config`, pdfium for
/// rasterisation and an in-memory job store.
///
/// # Errors
/// Input errors (missing file, not a PDF), provider resolution errors, and
/// every fatal pipeline error. Per-batch model failures are not errors: they
/// show up as `Error` page records in the result.
pub async fn analyze(
    input_str: impl AsRef<str>,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, AnalysisError> {
    let input_str = input_str.as_ref();
    info!("Starting analysis: {}", input_str);
    let document = input::load_document(input_str, config.call_timeout_secs).await?;
    let analyzer = Analyzer::from_config(config.clone(), Arc::new(InMemoryJobStore::new()))?;
    analyzer.analyze(document, JobOptions::default()).await
}

/// Submits documents and tracks their jobs.
///
/// Cheap to clone; clones share the same jobs.
#[derive(Clone)]
pub struct Analyzer {
    inner: Arc<Inner>,
}

struct Inner {
    config: AnalysisConfig,
    invoker: Arc<dyn ModelInvoker>,
    rasterizer: Arc<dyn Rasterizer>,
    store: Arc<dyn JobStore>,
    /// Progress receivers not yet handed to a subscriber.
    channels: DashMap<JobId, UnboundedReceiver<ProgressEvent>>,
    /// Cancellation tokens of running jobs. An entry is reserved before a
    /// run is prepared, so at most one run per job exists at a time.
    running: DashMap<JobId, CancellationToken>,
    workers: DashMap<JobId, WorkerHandle>,
}

impl Analyzer {
    pub fn new(
        config: AnalysisConfig,
        invoker: Arc<dyn ModelInvoker>,
        rasterizer: Arc<dyn Rasterizer>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                invoker,
                rasterizer,
                store,
                channels: DashMap::new(),
                running: DashMap::new(),
                workers: DashMap::new(),
            }),
        }
    }

    /// Production wiring: edgequake-llm providers and pdfium.
    pub fn from_config(config: AnalysisConfig, store: Arc<dyn JobStore>) -> Result<Self, AnalysisError> {
        let invoker = Arc::new(EdgequakeInvoker::from_config(&config)?);
        let rasterizer = Arc::new(PdfiumRasterizer::new(&config));
        Ok(Self::new(config, invoker, rasterizer, store))
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.inner.config
    }

    /// `submit(document, options) -> jobId`.
    ///
    /// Options are validated before anything else happens; a rejected
    /// submission creates no job.
    pub async fn submit(&self, document: Vec<u8>, options: JobOptions) -> Result<JobId, AnalysisError> {
        let resolved = self.inner.config.resolve(&options)?;
        input::validate_pdf(&document)?;

        let job = Job::new(resolved);
        let id = job.id;
        self.inner.store.persist(&job).await?;
        let cancel = self.reserve(id)?;
        info!(
            "Job {}: submitted ({} bytes, batch size {}, page limit {:?})",
            id,
            document.len(),
            resolved.batch_size,
            resolved.page_limit
        );
        self.spawn(job, document, cancel);
        Ok(id)
    }

    /// Re-run a persisted job that did not complete.
    ///
    /// Error pages are dropped and their batches retried; batches whose pages
    /// were all extracted are skipped. Synthesis always starts over.
    ///
    /// A concurrent second `resume` of the same job fails with
    /// [`AnalysisError::JobNotFinished`].
    pub async fn resume(&self, id: JobId, document: Vec<u8>) -> Result<JobId, AnalysisError> {
        let cancel = self.reserve(id)?;
        match self.prepare_resume(id, &document).await {
            Ok(job) => {
                self.spawn(job, document, cancel);
                Ok(id)
            }
            Err(e) => {
                self.inner.running.remove(&id);
                Err(e)
            }
        }
    }

    async fn prepare_resume(&self, id: JobId, document: &[u8]) -> Result<Job, AnalysisError> {
        let mut job = self.job(id).await?;
        if job.status == JobStatus::Complete {
            return Err(AnalysisError::Validation(format!("job {id} is already complete")));
        }
        input::validate_pdf(document)?;

        job.reset_for_resume();
        self.inner.store.persist(&job).await?;
        info!("Job {}: resuming with {} pages already extracted", id, job.pages.len());
        Ok(job)
    }

    /// Claim the single run slot of `id`.
    fn reserve(&self, id: JobId) -> Result<CancellationToken, AnalysisError> {
        match self.inner.running.entry(id) {
            Entry::Occupied(_) => Err(AnalysisError::JobNotFinished(id.to_string())),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(cancel.clone());
                Ok(cancel)
            }
        }
    }

    /// `subscribe(jobId)`: the job's ordered progress events.
    ///
    /// Only one subscriber per run; a second call while the run is live fails
    /// with [`AnalysisError::AlreadySubscribed`]. Once the run has ended, the
    /// stream holds just the terminal event.
    pub async fn subscribe(&self, id: JobId) -> Result<ProgressStream, AnalysisError> {
        if let Some((_, rx)) = self.inner.channels.remove(&id) {
            return Ok(ProgressStream::new(id, rx));
        }
        let job = self.job(id).await?;
        if job.status.is_terminal() && !self.inner.running.contains_key(&id) {
            return Ok(ProgressStream::replay(id, terminal_event(&job)));
        }
        Err(AnalysisError::AlreadySubscribed(id.to_string()))
    }

    /// `getResult(jobId)` for a job that reached a terminal state.
    pub async fn get_result(&self, id: JobId) -> Result<AnalysisResult, AnalysisError> {
        let job = self.job(id).await?;
        if !job.status.is_terminal() {
            return Err(AnalysisError::JobNotFinished(id.to_string()));
        }
        Ok(job.to_result())
    }

    /// Latest persisted snapshot of a job, whatever its state.
    pub async fn job(&self, id: JobId) -> Result<Job, AnalysisError> {
        self.inner
            .store
            .load(&id)
            .await?
            .ok_or_else(|| AnalysisError::JobNotFound(id.to_string()))
    }

    /// Wait for a job's worker and return its outcome.
    ///
    /// For a job that already finished (or was awaited before), the outcome
    /// is rebuilt from the stored snapshot: a failed run comes back as
    /// [`AnalysisError::JobFailed`], a cancelled one as
    /// [`AnalysisError::Cancelled`].
    pub async fn wait(&self, id: JobId) -> Result<AnalysisResult, AnalysisError> {
        if let Some((_, handle)) = self.inner.workers.remove(&id) {
            return handle
                .await
                .map_err(|e| AnalysisError::Internal(format!("worker task failed: {e}")))?;
        }
        let job = self.job(id).await?;
        match job.status {
            JobStatus::Complete => Ok(job.to_result()),
            JobStatus::Cancelled => Err(AnalysisError::Cancelled),
            JobStatus::Failed => Err(AnalysisError::JobFailed {
                id: id.to_string(),
                reason: job.error.unwrap_or_default(),
            }),
            JobStatus::Pending | JobStatus::Running => {
                Err(AnalysisError::JobNotFinished(id.to_string()))
            }
        }
    }

    /// Submit and wait, without a subscriber.
    pub async fn analyze(&self, document: Vec<u8>, options: JobOptions) -> Result<AnalysisResult, AnalysisError> {
        let id = self.submit(document, options).await?;
        let outcome = self.wait(id).await;
        self.inner.channels.remove(&id);
        outcome
    }

    /// Request cancellation. Returns `false` if the job is not running.
    ///
    /// No further model calls are issued; an in-flight call is abandoned.
    pub async fn cancel(&self, id: JobId) -> Result<bool, AnalysisError> {
        if let Some(token) = self.inner.running.get(&id) {
            info!("Job {}: cancellation requested", id);
            token.cancel();
            return Ok(true);
        }
        self.job(id).await.map(|_| false)
    }

    /// Drop every trace of a finished job.
    pub async fn remove(&self, id: JobId) -> Result<bool, AnalysisError> {
        if self.inner.running.contains_key(&id) {
            return Err(AnalysisError::JobNotFinished(id.to_string()));
        }
        self.inner.channels.remove(&id);
        self.inner.workers.remove(&id);
        Ok(self.inner.store.remove(&id).await?)
    }

    /// Answer a follow-up question about a finished job.
    ///
    /// `turns` is the conversation so far and must end with the user's
    /// question. The model sees the stored page records and synthesis, not
    /// the document itself.
    pub async fn chat(&self, id: JobId, turns: Vec<Turn>) -> Result<String, AnalysisError> {
        if turns.last().map(|t| t.role) != Some(Role::User) {
            return Err(AnalysisError::Validation(
                "chat needs a conversation ending with a user turn".into(),
            ));
        }
        let job = self.job(id).await?;
        if !job.status.is_terminal() {
            return Err(AnalysisError::JobNotFinished(id.to_string()));
        }

        let config = &self.inner.config;
        let system = prompts::chat_system_prompt(
            config.category,
            job.document_type,
            &job.pages,
            job.synthesis.as_ref(),
        );
        let mut transcript = Transcript::new();
        for turn in turns {
            transcript.push(turn);
        }
        let driver = ContinuationDriver::new(
            Arc::clone(&self.inner.invoker),
            config.max_continuation_rounds,
            config.call_timeout(),
            CancellationToken::new(),
        );
        let completion = driver.drive(Some(&system), &mut transcript).await?;
        info!(
            "Job {}: answered chat turn {} ({} chars)",
            id,
            transcript.len(),
            completion.text.chars().count()
        );
        Ok(completion.text)
    }

    fn spawn(&self, job: Job, document: Vec<u8>, cancel: CancellationToken) {
        let id = job.id;
        let (reporter, rx) = ChannelReporter::new();
        self.inner.channels.insert(id, rx);

        // The worker waits until its handle is registered, so its own
        // cleanup always finds the entry.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            let sink: SharedSink = Arc::new(reporter);
            let outcome = run_job(&inner, job, &document, sink, cancel).await;
            inner.workers.remove(&id);
            inner.running.remove(&id);
            outcome
        });
        self.inner.workers.insert(id, handle);
        let _ = registered_tx.send(());
    }
}

/// The event a finished run ended with, rebuilt from its snapshot.
fn terminal_event(job: &Job) -> ProgressEvent {
    match job.status {
        JobStatus::Complete => ProgressEvent::complete(job.to_result()),
        _ => ProgressEvent::error(
            job.error
                .clone()
                .unwrap_or_else(|| format!("job ended with status {}", job.status)),
        ),
    }
}

/// Worker body: run the pipeline, then persist and report the outcome.
async fn run_job(
    inner: &Inner,
    mut job: Job,
    document: &[u8],
    sink: SharedSink,
    cancel: CancellationToken,
) -> Result<AnalysisResult, AnalysisError> {
    let started = Instant::now();

    match execute(inner, &mut job, document, &sink, &cancel).await {
        Ok(synthesis) => {
            job.complete(synthesis);
            job.stats.total_duration_ms = started.elapsed().as_millis() as u64;
            let persisted = match inner.store.persist(&job).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Job {}: failed to persist final result: {}", job.id, e);
                    sink.emit(ProgressEvent::warning(PERSIST_FAILED_WARNING));
                    false
                }
            };
            info!(
                "Job {}: complete ({} pages, {} model calls, {}ms)",
                job.id, job.stats.total_pages, job.stats.model_calls, job.stats.total_duration_ms
            );
            let result = job.to_result();
            sink.emit(ProgressEvent::complete(result.clone()));
            release_channel(inner, job.id, persisted);
            Ok(result)
        }
        Err(e) => {
            let cancelled = matches!(e, AnalysisError::Cancelled);
            job.fail(e.to_string(), cancelled);
            job.stats.total_duration_ms = started.elapsed().as_millis() as u64;
            let persisted = match inner.store.persist(&job).await {
                Ok(()) => true,
                Err(pe) => {
                    error!("Job {}: failed to persist failure state: {}", job.id, pe);
                    false
                }
            };
            warn!("Job {}: {}: {}", job.id, job.status, e);
            sink.emit(ProgressEvent::error(e.to_string()));
            release_channel(inner, job.id, persisted);
            Err(e)
        }
    }
}

/// Drop an unclaimed channel once the store can replay its outcome.
fn release_channel(inner: &Inner, id: JobId, persisted: bool) {
    if persisted {
        inner.channels.remove(&id);
    }
}

async fn execute(
    inner: &Inner,
    job: &mut Job,
    document: &[u8],
    sink: &SharedSink,
    cancel: &CancellationToken,
) -> Result<SynthesisResult, AnalysisError> {
    let config = &inner.config;
    let driver = ContinuationDriver::new(
        Arc::clone(&inner.invoker),
        config.max_continuation_rounds,
        config.call_timeout(),
        cancel.clone(),
    );

    // ── Step 1: Rasterise ────────────────────────────────────────────────
    job.advance(JobStage::Rasterizing);
    checkpoint(inner.store.as_ref(), job).await;
    let page_limit = job.options.page_limit;
    if let Some(limit) = page_limit {
        let total = inner.rasterizer.page_count(document).await?;
        if limit < total {
            sink.emit(ProgressEvent::progress(format!(
                "Processing only the first {limit} pages"
            )));
        }
    }
    let images = inner.rasterizer.rasterize(document, page_limit).await?;
    if images.is_empty() {
        return Err(AnalysisError::Validation("document has no pages".into()));
    }
    job.total_pages = Some(images.len());
    info!("Job {}: {} pages to analyse", job.id, images.len());

    if cancel.is_cancelled() {
        return Err(AnalysisError::Cancelled);
    }

    // ── Step 2: Classify (optional) ──────────────────────────────────────
    if config.classify && job.document_type.is_none() {
        ClassificationStage::new(driver.clone(), config.category, Arc::clone(sink))
            .run(job, &images[0])
            .await?;
    }

    // ── Step 3: Extract ──────────────────────────────────────────────────
    ExtractionStage::new(
        driver.clone(),
        config.category,
        Arc::clone(sink),
        Arc::clone(&inner.store),
    )
    .run(job, &images)
    .await?;
    drop(images);
    sink.emit(ProgressEvent::phase_complete(Phase::Extraction));

    // ── Step 4: Synthesize ───────────────────────────────────────────────
    let (synthesis, _report) = SynthesisStage::new(
        driver,
        SynthesisSettings::from_config(config),
        Arc::clone(sink),
        Arc::clone(&inner.store),
    )
    .run(job)
    .await?;
    sink.emit(ProgressEvent::phase_complete(Phase::Synthesis));

    Ok(synthesis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolvedOptions;
    use crate::error::{ModelError, StoreError};
    use crate::pipeline::llm::{ModelReply, StopReason};
    use crate::store::FileJobStore;
    use crate::testing::{page_blocks, FakeRasterizer, ScriptedInvoker};
    use async_trait::async_trait;
    use std::time::Duration;

    const PDF: &[u8] = b"%PDF-1.7 test document";

    const SYNTHESIS_OUTPUT: &str = "<output>{\"RISK_ASSESSMENT\": \"low\", \"DISCREPANCIES\": \"\", \
         \"MEDICAL_TIMELINE\": \"\", \"FINAL_RECOMMENDATION\": \"none\"}</output>";

    fn analyzer_with(invoker: Arc<ScriptedInvoker>, pages: usize, store: Arc<dyn JobStore>) -> Analyzer {
        let config = AnalysisConfig::builder().focus_updates(false).build().unwrap();
        Analyzer::new(config, invoker, Arc::new(FakeRasterizer { pages }), store)
    }

    fn analyzer(invoker: ScriptedInvoker, pages: usize) -> Analyzer {
        analyzer_with(Arc::new(invoker), pages, Arc::new(InMemoryJobStore::new()))
    }

    fn complete(text: String) -> Result<ModelReply, ModelError> {
        Ok(ModelReply::new(text, StopReason::Complete))
    }

    fn synthesis_reply() -> Result<ModelReply, ModelError> {
        complete(SYNTHESIS_OUTPUT.to_string())
    }

    /// One reply that serves extraction of page 1 and every synthesis turn.
    fn single_page_reply() -> ModelReply {
        ModelReply::new(
            format!("{}{}", page_blocks(1..=1), SYNTHESIS_OUTPUT),
            StopReason::Complete,
        )
    }

    /// Accepts every snapshot except the completed one.
    #[derive(Default)]
    struct FinalWriteFails(InMemoryJobStore);

    #[async_trait]
    impl JobStore for FinalWriteFails {
        async fn persist(&self, job: &Job) -> Result<(), StoreError> {
            if job.status == JobStatus::Complete {
                return Err(StoreError::Io {
                    path: "jobs/final.json".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.0.persist(job).await
        }

        async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
            self.0.load(id).await
        }

        async fn remove(&self, id: &JobId) -> Result<bool, StoreError> {
            self.0.remove(id).await
        }
    }

    async fn until_idle(a: &Analyzer) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !a.inner.running.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("workers did not finish");
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_a_job_exists() {
        let a = analyzer(ScriptedInvoker::new(vec![]), 3);
        let err = a
            .submit(PDF.to_vec(), JobOptions::default().with_batch_size(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)));

        let err = a.submit(Vec::new(), JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Validation(_)));
    }

    #[tokio::test]
    async fn submit_then_wait_completes() {
        let a = analyzer(
            ScriptedInvoker::new(vec![
                complete(page_blocks(1..=2)),
                synthesis_reply(),
                synthesis_reply(),
            ]),
            2,
        );
        let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
        let result = a.wait(id).await.unwrap();
        assert_eq!(result.status, JobStatus::Complete);
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.synthesis.unwrap().risk_assessment, "low");
        assert_eq!(result.stats.model_calls, 3);

        let stored = a.get_result(id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn second_subscriber_is_refused() {
        let a = analyzer(ScriptedInvoker::new(vec![]), 1);
        let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
        let _stream = a.subscribe(id).await.unwrap();
        assert!(matches!(
            a.subscribe(id).await,
            Err(AnalysisError::AlreadySubscribed(_))
        ));
        assert!(matches!(
            a.subscribe(JobId::new()).await,
            Err(AnalysisError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_job_reports_failed_status() {
        let a = analyzer(ScriptedInvoker::new(vec![]), 2);
        let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
        let err = a.wait(id).await.unwrap_err();
        assert!(matches!(err, AnalysisError::AllBatchesFailed { .. }));

        let result = a.get_result(id).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error.unwrap().contains("All 1"));
        assert_eq!(result.pages.len(), 2, "partial state is persisted");

        // Later calls answer from the stored snapshot.
        match a.wait(id).await {
            Err(AnalysisError::JobFailed { reason, .. }) => assert!(reason.contains("All 1")),
            other => panic!("expected JobFailed, got {other:?}"),
        }
        let events = a.subscribe(id).await.unwrap().collect_all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "error");
    }

    #[tokio::test]
    async fn finished_jobs_leave_no_registry_entries() {
        let a = analyzer(ScriptedInvoker::repeating(single_page_reply()), 1);
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap());
        }
        until_idle(&a).await;

        assert!(a.inner.channels.is_empty());
        assert!(a.inner.workers.is_empty());
        for id in &ids {
            assert_eq!(a.get_result(*id).await.unwrap().status, JobStatus::Complete);
        }

        let events = a.subscribe(ids[0]).await.unwrap().collect_all().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ProgressEvent::Complete { result } if result.status == JobStatus::Complete
        ));
        assert_eq!(a.wait(ids[1]).await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn concurrent_resumes_start_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));
        let mut job = Job::new(ResolvedOptions {
            batch_size: 3,
            page_limit: None,
        });
        job.fail("boom", false);
        store.persist(&job).await.unwrap();

        let invoker = Arc::new(ScriptedInvoker::repeating(single_page_reply()));
        let a = analyzer_with(invoker.clone(), 1, store);
        let (first, second) = tokio::join!(
            a.resume(job.id, PDF.to_vec()),
            a.resume(job.id, PDF.to_vec())
        );
        let refused: Vec<_> = [first, second].into_iter().filter_map(Result::err).collect();
        assert_eq!(refused.len(), 1, "exactly one resume starts a run");
        assert!(matches!(refused[0], AnalysisError::JobNotFinished(_)));

        let result = a.wait(job.id).await.unwrap();
        assert_eq!(result.status, JobStatus::Complete);
        // One extraction batch, seed, one refinement round.
        assert_eq!(invoker.calls(), 3);

        assert!(matches!(
            a.resume(job.id, PDF.to_vec()).await,
            Err(AnalysisError::Validation(_))
        ));
        assert!(a.inner.running.is_empty(), "a refused resume releases its slot");
    }

    #[tokio::test]
    async fn unwritable_final_snapshot_is_reported_before_completion() {
        let a = analyzer_with(
            Arc::new(ScriptedInvoker::repeating(single_page_reply())),
            1,
            Arc::new(FinalWriteFails::default()),
        );
        let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
        let result = a.wait(id).await.unwrap();
        assert_eq!(result.status, JobStatus::Complete);

        // The channel is the only copy of the outcome, so it is kept.
        assert!(a.inner.channels.contains_key(&id));
        let events = a.subscribe(id).await.unwrap().collect_all().await;
        let tail: Vec<_> = events[events.len() - 2..].iter().collect();
        assert_eq!(tail[0].kind(), "warning");
        assert_eq!(tail[0].message(), Some(PERSIST_FAILED_WARNING));
        assert!(matches!(
            tail[1],
            ProgressEvent::Complete { result } if result.status == JobStatus::Complete
        ));
        assert_ne!(a.job(id).await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn chat_answers_from_the_stored_analysis() {
        let invoker = Arc::new(ScriptedInvoker::new(vec![
            complete(page_blocks(1..=2)),
            synthesis_reply(),
            synthesis_reply(),
            complete("Metformin appears on [pg 2](/page/2).".to_string()),
        ]));
        let a = analyzer_with(invoker.clone(), 2, Arc::new(InMemoryJobStore::new()));
        let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
        assert!(matches!(
            a.chat(id, vec![Turn::user("Any medications?")]).await,
            Err(AnalysisError::JobNotFinished(_))
        ));
        a.wait(id).await.unwrap();

        let answer = a
            .chat(
                id,
                vec![
                    Turn::user("Any medications?"),
                    Turn::assistant("Metformin."),
                    Turn::user("On which page?"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(answer, "Metformin appears on [pg 2](/page/2).");

        let request = invoker.requests().pop().unwrap();
        let system = request.system.unwrap();
        assert!(system.contains("Page 2: [Form 2] content of page 2"));
        assert!(system.contains("\"RISK_ASSESSMENT\": \"low\""));
        assert_eq!(request.turn_count, 3);
        assert_eq!(request.last_user_text, "On which page?");
        assert!(request.image_pages.is_empty());
    }

    #[tokio::test]
    async fn chat_rejects_bad_conversations_and_unknown_jobs() {
        let a = analyzer(ScriptedInvoker::new(vec![]), 1);
        let id = JobId::new();
        assert!(matches!(a.chat(id, vec![]).await, Err(AnalysisError::Validation(_))));
        assert!(matches!(
            a.chat(id, vec![Turn::assistant("hello")]).await,
            Err(AnalysisError::Validation(_))
        ));
        assert!(matches!(
            a.chat(id, vec![Turn::user("hello")]).await,
            Err(AnalysisError::JobNotFound(_))
        ));
    }
}
