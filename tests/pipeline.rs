//! Integration tests for the job lifecycle.
//!
//! These drive [`Analyzer`] end to end with an in-process model and
//! rasteriser, so they need neither pdfium nor an API key.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use underwrite_pipeline::output::NO_ANALYSIS_FOUND;
use underwrite_pipeline::{
    AnalysisConfig, AnalysisError, Analyzer, FileJobStore, InMemoryJobStore, JobId, JobOptions,
    JobStatus, JobStore, ModelError, ModelInvoker, ModelReply, ModelRequest, ModelTier, PageImage,
    ProgressEvent, Rasterizer, StopReason,
};

const PDF: &[u8] = b"%PDF-1.4\n% integration fixture\n";

const SYNTHESIS_REPLY: &str = r#"<thinking>weighing the evidence</thinking>
<output>
{"RISK_ASSESSMENT": "Standard risk (p.1)", "DISCREPANCIES": "None found",
 "MEDICAL_TIMELINE": "2019: annual physical (p.2)", "FINAL_RECOMMENDATION": "Approve at standard rates"}
</output>"#;

// ── Test doubles ─────────────────────────────────────────────────────────────

/// Answers extraction requests for the pages it was shown and synthesis
/// requests with a fixed assessment.
#[derive(Default)]
struct FakeModel {
    /// Any extraction batch containing one of these pages fails.
    fail_pages: BTreeSet<usize>,
    /// Pages the model silently leaves out of its answer.
    omit_pages: BTreeSet<usize>,
    fail_synthesis: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeModel {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelInvoker for FakeModel {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if request.tier == ModelTier::Fast {
            return Ok(ModelReply::new("<output>Reviewing records</output>", StopReason::Complete));
        }

        let pages: Vec<usize> = request
            .turns
            .iter()
            .flat_map(|t| t.images.iter().map(|(_, img)| img.page_num))
            .collect();

        if pages.is_empty() {
            if self.fail_synthesis {
                return Err(ModelError::Transport("HTTP 503".into()));
            }
            return Ok(ModelReply::new(SYNTHESIS_REPLY, StopReason::Complete));
        }

        if pages.iter().any(|p| self.fail_pages.contains(p)) {
            return Err(ModelError::Transport("HTTP 503".into()));
        }
        let text: String = pages
            .iter()
            .filter(|p| !self.omit_pages.contains(p))
            .map(|p| {
                format!(
                    "<output page=\"{p}\"><page_type>Lab Report</page_type>\
                     <page_content>Findings on page {p}</page_content></output>\n"
                )
            })
            .collect();
        Ok(ModelReply::new(text, StopReason::Complete))
    }
}

struct FakePdf {
    pages: usize,
}

#[async_trait]
impl Rasterizer for FakePdf {
    async fn rasterize(
        &self,
        _document: &[u8],
        page_limit: Option<usize>,
    ) -> Result<Vec<PageImage>, AnalysisError> {
        let n = page_limit.map_or(self.pages, |l| l.min(self.pages));
        Ok((1..=n)
            .map(|page_num| PageImage {
                page_num,
                data: "iVBORw0KGgo=".into(),
                mime_type: "image/png".into(),
            })
            .collect())
    }

    async fn page_count(&self, _document: &[u8]) -> Result<usize, AnalysisError> {
        Ok(self.pages)
    }
}

fn config() -> AnalysisConfig {
    AnalysisConfig::builder()
        .focus_updates(false)
        .build()
        .expect("valid config")
}

fn analyzer_with(model: Arc<FakeModel>, pages: usize, store: Arc<dyn JobStore>) -> Analyzer {
    Analyzer::new(config(), model, Arc::new(FakePdf { pages }), store)
}

fn analyzer(model: FakeModel, pages: usize) -> (Analyzer, Arc<FakeModel>) {
    let model = Arc::new(model);
    let a = analyzer_with(model.clone(), pages, Arc::new(InMemoryJobStore::new()));
    (a, model)
}

fn terminal_count(events: &[ProgressEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_middle_batch_still_completes_the_job() {
    let (a, _) = analyzer(
        FakeModel {
            fail_pages: BTreeSet::from([5]),
            ..Default::default()
        },
        7,
    );
    let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
    let events = a.subscribe(id).await.unwrap().collect_all().await;

    assert_eq!(terminal_count(&events), 1);
    let Some(ProgressEvent::Complete { result }) = events.last() else {
        panic!("expected complete event, got {:?}", events.last());
    };
    assert_eq!(result.status, JobStatus::Complete);
    assert_eq!(result.pages.keys().copied().collect::<Vec<_>>(), (1..=7).collect::<Vec<_>>());
    for p in 4..=6 {
        assert!(result.pages[&p].is_error(), "page {p} should carry an error record");
    }
    assert_eq!(result.pages[&7].content, "Findings on page 7");
    assert_eq!(
        result.synthesis.as_ref().unwrap().final_recommendation,
        "Approve at standard rates"
    );

    let batches = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::BatchComplete { .. }))
        .count();
    assert_eq!(batches, 3);
    assert!(events
        .iter()
        .any(|e| e.kind() == "warning" && e.message().unwrap_or("").contains("Pages 4 to 6")));

    let stored = a.get_result(id).await.unwrap();
    assert_eq!(&stored, result.as_ref());
}

#[tokio::test]
async fn omitted_pages_are_filled_with_placeholders() {
    let (a, _) = analyzer(
        FakeModel {
            omit_pages: BTreeSet::from([2]),
            ..Default::default()
        },
        4,
    );
    let result = a.analyze(PDF.to_vec(), JobOptions::default()).await.unwrap();
    assert_eq!(result.pages.len(), 4);
    assert!(result.pages[&2].is_placeholder());
    assert_eq!(result.pages[&2].content, NO_ANALYSIS_FOUND);
    assert_eq!(result.stats.placeholder_pages, 1);
}

#[tokio::test]
async fn zero_batch_size_is_rejected_up_front() {
    let (a, model) = analyzer(FakeModel::default(), 3);
    let err = a
        .submit(PDF.to_vec(), JobOptions::default().with_batch_size(0))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Validation(_)));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn non_pdf_bytes_are_rejected() {
    let (a, _) = analyzer(FakeModel::default(), 3);
    let err = a
        .submit(b"GIF89a".to_vec(), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::NotAPdf { .. }));
}

#[tokio::test]
async fn each_job_has_a_single_subscriber() {
    let (a, _) = analyzer(FakeModel::default(), 2);
    let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
    let first = a.subscribe(id).await.unwrap();
    assert!(matches!(
        a.subscribe(id).await,
        Err(AnalysisError::AlreadySubscribed(_))
    ));
    let events = first.collect_all().await;
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn page_limit_truncates_and_is_announced() {
    let (a, _) = analyzer(FakeModel::default(), 10);
    let id = a
        .submit(PDF.to_vec(), JobOptions::default().with_page_limit(4))
        .await
        .unwrap();
    let events = a.subscribe(id).await.unwrap().collect_all().await;
    assert!(events
        .iter()
        .any(|e| e.message() == Some("Processing only the first 4 pages")));

    let result = a.get_result(id).await.unwrap();
    assert_eq!(result.pages.len(), 4);
    assert_eq!(result.stats.total_pages, 4);
}

#[tokio::test]
async fn cancelled_job_ends_with_an_error_event() {
    let (a, _) = analyzer(
        FakeModel {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        },
        9,
    );
    let id = a.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
    assert!(a.cancel(id).await.unwrap());

    let events = a.subscribe(id).await.unwrap().collect_all().await;
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(events.last().map(|e| e.kind()), Some("error"));

    assert!(matches!(a.wait(id).await, Err(AnalysisError::Cancelled)));
    let result = a.get_result(id).await.unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert!(!a.cancel(id).await.unwrap(), "finished jobs cannot be cancelled");
}

#[tokio::test]
async fn unknown_jobs_are_reported() {
    let (a, _) = analyzer(FakeModel::default(), 1);
    let id = JobId::new();
    assert!(matches!(a.get_result(id).await, Err(AnalysisError::JobNotFound(_))));
    assert!(matches!(a.subscribe(id).await, Err(AnalysisError::JobNotFound(_))));
}

#[tokio::test]
async fn resume_reuses_extracted_pages() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(dir.path()));

    let broken = Arc::new(FakeModel {
        fail_synthesis: true,
        ..Default::default()
    });
    let first = analyzer_with(broken, 3, store.clone());
    let id = first.submit(PDF.to_vec(), JobOptions::default()).await.unwrap();
    assert!(first.wait(id).await.is_err());
    let failed = first.get_result(id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.pages.len(), 3);

    // A fresh process sees only what the store kept.
    let healthy = Arc::new(FakeModel::default());
    let second = analyzer_with(healthy.clone(), 3, store);
    second.resume(id, PDF.to_vec()).await.unwrap();
    let events = second.subscribe(id).await.unwrap().collect_all().await;
    assert!(events
        .iter()
        .any(|e| e.message() == Some("Pages 1 to 3 already extracted, skipping")));

    let result = second.wait(id).await.unwrap();
    assert_eq!(result.status, JobStatus::Complete);
    assert_eq!(result.pages.len(), 3);
    // Seed plus one refinement round; no extraction calls.
    assert_eq!(healthy.calls(), 2);

    assert!(matches!(
        second.resume(id, PDF.to_vec()).await,
        Err(AnalysisError::Validation(_))
    ));
}
