//! # underwrite-pipeline
//!
//! Turn a multi-page PDF submission into a structured underwriting risk
//! analysis using vision-capable LLMs.
//!
//! ## Why this crate?
//!
//! Underwriting packets are long: attending-physician statements, lab
//! reports, prescription histories, loss runs. No single model call can read
//! them whole, and model replies are truncated at the output-token limit. This
//! crate batches the pages, transparently continues truncated replies, parses
//! the model's tagged output tolerantly, and folds the per-page findings into
//! one assessment across as many refinement rounds as the document needs.
//! Every step is checkpointed so a failed or cancelled job can be resumed.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve local file or download from URL, check %PDF magic
//!  ├─ 2. Render     rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Classify   optional first-page document type from a closed set
//!  ├─ 4. Extract    batches of B pages → one record per page
//!  ├─ 5. Synthesize seed + refinement rounds of R records → four-field result
//!  └─ 6. Output     persisted job record + ordered progress events
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use underwrite_pipeline::{analyze, AnalysisConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = AnalysisConfig::default();
//!     let result = analyze("submission.pdf", &config).await?;
//!     if let Some(synthesis) = &result.synthesis {
//!         println!("{}", synthesis.final_recommendation);
//!     }
//!     eprintln!("{} model calls", result.stats.model_calls);
//!     Ok(())
//! }
//! ```
//!
//! For long-running services use [`Analyzer`]: `submit` returns a [`JobId`]
//! at once, `subscribe` yields the job's [`ProgressEvent`]s, and `get_result`
//! reads the persisted outcome, and `chat` answers follow-up questions about a
//! finished job.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `underwrite` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! underwrite-pipeline = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyze;
pub mod config;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyze::{analyze, Analyzer};
pub use config::{AnalysisConfig, AnalysisConfigBuilder, DocumentCategory, JobOptions, ResolvedOptions};
pub use error::{AnalysisError, ModelError, StoreError};
pub use job::{Job, JobId, JobStage, JobStatus};
pub use output::{AnalysisResult, AnalysisStats, DocumentType, PageRecord, SynthesisResult};
pub use pipeline::llm::{ModelInvoker, ModelReply, ModelRequest, ModelTier, Role, StopReason, Turn};
pub use pipeline::render::{PageImage, Rasterizer};
pub use progress::{ChannelReporter, NoopSink, Phase, ProgressEvent, ProgressSink};
pub use store::{FileJobStore, InMemoryJobStore, JobStore};
pub use stream::ProgressStream;
