//! Pipeline stages for document analysis.
//!
//! Each submodule implements one step. Stages talk to the model only through
//! [`llm::ModelInvoker`] and to the rasteriser only through
//! [`render::Rasterizer`], so every stage is testable with doubles.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ classify? ──▶ extract ──▶ synthesize
//! (path/URL) (pdfium)  (page 1)      (batches)   (refinement rounds)
//! ```
//!
//! 1. [`input`]     : load a path or URL, check the `%PDF` magic
//! 2. [`render`]    : rasterise pages in `spawn_blocking`, PNG/base64 encode
//! 3. [`classify`]  : optional first-page label from a closed set
//! 4. [`extract`]   : per-batch extraction via [`continuation`] + [`parse`]
//! 5. [`synthesize`]: iterative refinement of one structured assessment
//!
//! [`batch`] groups pages for both extraction and synthesis.

pub mod batch;
pub mod classify;
pub mod continuation;
pub mod extract;
pub mod input;
pub mod llm;
pub mod parse;
pub mod render;
pub mod synthesize;

use crate::job::Job;
use crate::store::JobStore;
use tracing::warn;

/// Persist an intermediate snapshot. Failures are logged, not raised: the
/// in-memory job stays authoritative and the next checkpoint retries.
pub(crate) async fn checkpoint(store: &dyn JobStore, job: &Job) {
    if let Err(e) = store.persist(job).await {
        warn!("Job {}: checkpoint failed: {}", job.id, e);
    }
}
