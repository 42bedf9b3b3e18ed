//! Error types for the underwrite-pipeline library.
//!
//! Two tiers mirror the two recovery scopes of the pipeline:
//!
//! * [`AnalysisError`] is **fatal**: the job cannot proceed (bad batch size,
//!   empty document, model service unreachable for every batch, cancellation).
//!   Returned as `Err(AnalysisError)` from the top-level entry points and
//!   reported to subscribers as the terminal `error` event.
//!
//! * [`ModelError`] is **per call**: one logical model call (including all of
//!   its continuation rounds) failed. The extraction stage converts it into
//!   `Error` page records for the affected batch; the synthesis stage keeps its
//!   best result and moves on. Only when a call failure happens at job scope
//!   (seeding synthesis, every batch failing) is it promoted to an
//!   `AnalysisError` via `From`.
//!
//! [`StoreError`] covers the job store; persistence failures never lose the
//! in-memory result, they surface as warnings.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the underwrite-pipeline library.
#[derive(Debug, Error)]
pub enum AnalysisError {
    // ── Validation ────────────────────────────────────────────────────────
    /// Input rejected before any stage started (batch size, empty document).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The input is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("Document is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF is encrypted and requires a password")]
    PasswordRequired,

    /// pdfium returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The model service could not be reached or rejected the request.
    #[error("Model transport error: {0}")]
    Transport(String),

    /// The model kept hitting its output-length limit.
    #[error("Continuation exhausted after {rounds} rounds")]
    ContinuationExhausted { rounds: usize },

    /// A logical model call exceeded its time budget.
    #[error("Model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Every extraction batch failed; the model service is effectively unreachable.
    #[error("All {batches} extraction batches failed.\nFirst error: {first_error}")]
    AllBatchesFailed { batches: usize, first_error: String },

    /// The job was cancelled before it finished.
    #[error("Job was cancelled")]
    Cancelled,

    // ── Job registry ──────────────────────────────────────────────────────
    /// No job with this identifier is known to the store.
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// The job's progress stream was already handed to a subscriber.
    #[error("Job '{0}' already has a subscriber")]
    AlreadySubscribed(String),

    /// The job has not reached a terminal state yet.
    #[error("Job '{0}' is still running")]
    JobNotFinished(String),

    /// The job ended in failure on an earlier run; `reason` is what it stored.
    #[error("Job '{id}' failed: {reason}")]
    JobFailed { id: String, reason: String },

    /// Persisting or loading job state failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of one logical model call.
///
/// Cheap to clone so the extraction stage can stamp the same reason onto
/// every page record of a failed batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// The provider call failed after the adapter's own retries.
    #[error("model call failed: {0}")]
    Transport(String),

    /// Output was still truncated after the configured number of rounds.
    #[error("continuation exhausted after {rounds} rounds")]
    ContinuationExhausted { rounds: usize },

    /// The whole logical call (all rounds) exceeded its budget.
    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Cancellation was requested while the call was in flight.
    #[error("model call cancelled")]
    Cancelled,
}

impl ModelError {
    /// Cancellation is never recovered locally; it always ends the job.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModelError::Cancelled)
    }
}

impl From<ModelError> for AnalysisError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Transport(detail) => AnalysisError::Transport(detail),
            ModelError::ContinuationExhausted { rounds } => {
                AnalysisError::ContinuationExhausted { rounds }
            }
            ModelError::Timeout { secs } => AnalysisError::Timeout { secs },
            ModelError::Cancelled => AnalysisError::Cancelled,
        }
    }
}

/// Job store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job state (de)serialisation failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_batches_failed_display() {
        let e = AnalysisError::AllBatchesFailed {
            batches: 3,
            first_error: "connection refused".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("All 3"), "got: {msg}");
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn model_error_maps_to_fatal_variant() {
        let e: AnalysisError = ModelError::ContinuationExhausted { rounds: 8 }.into();
        assert!(matches!(e, AnalysisError::ContinuationExhausted { rounds: 8 }));

        let e: AnalysisError = ModelError::Timeout { secs: 30 }.into();
        assert!(e.to_string().contains("30s"));

        let e: AnalysisError = ModelError::Cancelled.into();
        assert!(matches!(e, AnalysisError::Cancelled));
    }

    #[test]
    fn only_cancellation_is_flagged() {
        assert!(ModelError::Cancelled.is_cancelled());
        assert!(!ModelError::Transport("503".into()).is_cancelled());
    }

    #[test]
    fn not_a_pdf_shows_magic() {
        let e = AnalysisError::NotAPdf { magic: *b"GIF8" };
        assert!(e.to_string().contains("71"), "got: {e}");
    }
}
