//! Configuration types for document analysis.
//!
//! All pipeline behaviour is controlled through [`AnalysisConfig`], built via
//! its [`AnalysisConfigBuilder`]. Per-job overrides supplied at submission
//! time live in [`JobOptions`] and are resolved against the config once, when
//! the job is created.

use crate::error::AnalysisError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an analysis run.
///
/// Built via [`AnalysisConfig::builder()`] or using
/// [`AnalysisConfig::default()`].
///
/// # Example
/// ```rust
/// use underwrite_pipeline::AnalysisConfig;
///
/// let config = AnalysisConfig::builder()
///     .batch_size(4)
///     .synthesis_batch_size(12)
///     .model("claude-sonnet-4-20250514")
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 4);
/// ```
#[derive(Clone)]
pub struct AnalysisConfig {
    /// Pages per extraction call (B). Default: 3.
    ///
    /// Small batches keep each vision request well under provider image
    /// limits and make a failed batch cheap; the page numbering is the same
    /// for any value.
    pub batch_size: usize,

    /// Page records folded into the synthesis per refinement round (R). Default: 10.
    pub synthesis_batch_size: usize,

    /// Only rasterise and analyse the first N pages. Default: all pages.
    pub page_limit: Option<usize>,

    /// Line of business the document belongs to. Drives classification labels
    /// and the extraction prompt. Default: [`DocumentCategory::Life`].
    pub category: DocumentCategory,

    /// Classify the document from its first page before extraction. Default: false.
    pub classify: bool,

    /// Rendering DPI used when rasterising each page. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered image dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Primary model identifier for extraction and synthesis.
    pub model: Option<String>,

    /// Cheap model used for "current focus" summaries. Falls back to `model`.
    pub fast_model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed primary provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed fast provider.
    pub fast_provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Output token budget of a single model round. Default: 2048.
    ///
    /// Deliberately modest: the continuation driver stitches longer answers
    /// together, so this only bounds the size of one round.
    pub max_tokens: usize,

    /// Output token budget for focus summaries. Default: 100.
    pub focus_max_tokens: usize,

    /// Transport retries inside one model round. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Upper bound on rounds of one logical call, continuations included. Default: 8.
    pub max_continuation_rounds: usize,

    /// Time budget for one logical call (all rounds). Default: 300.
    pub call_timeout_secs: u64,

    /// Synthesis is finalised after this many refinement rounds. Default: 50.
    pub max_synthesis_rounds: usize,

    /// Synthesis is finalised once the transcript exceeds this many characters. Default: 400 000.
    pub max_transcript_chars: usize,

    /// Derive "current focus" progress messages between refinement rounds. Default: true.
    pub focus_updates: bool,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            synthesis_batch_size: 10,
            page_limit: None,
            category: DocumentCategory::default(),
            classify: false,
            dpi: 150,
            max_rendered_pixels: 2000,
            model: None,
            fast_model: None,
            provider_name: None,
            provider: None,
            fast_provider: None,
            temperature: 0.0,
            max_tokens: 2048,
            focus_max_tokens: 100,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_continuation_rounds: 8,
            call_timeout_secs: 300,
            max_synthesis_rounds: 50,
            max_transcript_chars: 400_000,
            focus_updates: true,
            password: None,
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("batch_size", &self.batch_size)
            .field("synthesis_batch_size", &self.synthesis_batch_size)
            .field("page_limit", &self.page_limit)
            .field("category", &self.category)
            .field("classify", &self.classify)
            .field("dpi", &self.dpi)
            .field("model", &self.model)
            .field("fast_model", &self.fast_model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "fast_provider",
                &self.fast_provider.as_ref().map(|_| "<dyn LLMProvider>"),
            )
            .field("max_tokens", &self.max_tokens)
            .field("max_continuation_rounds", &self.max_continuation_rounds)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("max_synthesis_rounds", &self.max_synthesis_rounds)
            .field("max_transcript_chars", &self.max_transcript_chars)
            .finish()
    }
}

impl AnalysisConfig {
    /// Create a new builder for `AnalysisConfig`.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }

    /// Budget for one logical model call.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Resolve per-job overrides against this config.
    ///
    /// A batch size of zero is an input-validation error, not a clamp: the
    /// caller asked for something meaningless and should hear about it.
    pub fn resolve(&self, options: &JobOptions) -> Result<ResolvedOptions, AnalysisError> {
        let batch_size = options.batch_size.unwrap_or(self.batch_size);
        if batch_size == 0 {
            return Err(AnalysisError::Validation(
                "batch size must be a positive integer".into(),
            ));
        }
        if options.page_limit == Some(0) {
            return Err(AnalysisError::Validation(
                "page limit must be at least 1 when set".into(),
            ));
        }
        Ok(ResolvedOptions {
            batch_size,
            page_limit: options.page_limit.or(self.page_limit),
        })
    }
}

/// Builder for [`AnalysisConfig`].
#[derive(Debug)]
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n;
        self
    }

    pub fn synthesis_batch_size(mut self, n: usize) -> Self {
        self.config.synthesis_batch_size = n;
        self
    }

    pub fn page_limit(mut self, n: usize) -> Self {
        self.config.page_limit = Some(n);
        self
    }

    pub fn category(mut self, category: DocumentCategory) -> Self {
        self.config.category = category;
        self
    }

    pub fn classify(mut self, v: bool) -> Self {
        self.config.classify = v;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn fast_model(mut self, model: impl Into<String>) -> Self {
        self.config.fast_model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn fast_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.fast_provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn focus_max_tokens(mut self, n: usize) -> Self {
        self.config.focus_max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_continuation_rounds(mut self, n: usize) -> Self {
        self.config.max_continuation_rounds = n;
        self
    }

    pub fn call_timeout_secs(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs;
        self
    }

    pub fn max_synthesis_rounds(mut self, n: usize) -> Self {
        self.config.max_synthesis_rounds = n;
        self
    }

    pub fn max_transcript_chars(mut self, n: usize) -> Self {
        self.config.max_transcript_chars = n;
        self
    }

    pub fn focus_updates(mut self, v: bool) -> Self {
        self.config.focus_updates = v;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, AnalysisError> {
        let c = &self.config;
        if c.batch_size == 0 {
            return Err(AnalysisError::InvalidConfig(
                "batch_size must be ≥ 1".into(),
            ));
        }
        if c.synthesis_batch_size == 0 {
            return Err(AnalysisError::InvalidConfig(
                "synthesis_batch_size must be ≥ 1".into(),
            ));
        }
        if c.max_continuation_rounds == 0 {
            return Err(AnalysisError::InvalidConfig(
                "max_continuation_rounds must be ≥ 1".into(),
            ));
        }
        if c.max_synthesis_rounds == 0 {
            return Err(AnalysisError::InvalidConfig(
                "max_synthesis_rounds must be ≥ 1".into(),
            ));
        }
        if c.page_limit == Some(0) {
            return Err(AnalysisError::InvalidConfig(
                "page_limit must be ≥ 1 when set".into(),
            ));
        }
        if c.call_timeout_secs == 0 {
            return Err(AnalysisError::InvalidConfig(
                "call_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Per-job options ──────────────────────────────────────────────────────

/// Options supplied with a single submission. `None` means "use the config".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub batch_size: Option<usize>,
    pub page_limit: Option<usize>,
}

impl JobOptions {
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }

    pub fn with_page_limit(mut self, n: usize) -> Self {
        self.page_limit = Some(n);
        self
    }
}

/// [`JobOptions`] after validation and defaulting; stored on the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    pub batch_size: usize,
    pub page_limit: Option<usize>,
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Line of business a submission belongs to.
///
/// The category decides which document labels classification may return and
/// how the extraction prompt frames the reviewer's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    /// Individual life insurance applications and their medical evidence. (default)
    #[default]
    Life,
    /// Commercial property & casualty submissions.
    PropertyCasualty,
}

impl DocumentCategory {
    /// Short human description used inside prompts.
    pub fn describe(&self) -> &'static str {
        match self {
            DocumentCategory::Life => "an individual life insurance application",
            DocumentCategory::PropertyCasualty => "a commercial property & casualty submission",
        }
    }
}

impl std::str::FromStr for DocumentCategory {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "life" => Ok(DocumentCategory::Life),
            "property_casualty" | "pc" | "p&c" => Ok(DocumentCategory::PropertyCasualty),
            other => Err(AnalysisError::InvalidConfig(format!(
                "unknown document category '{other}' (expected life or property_casualty)"
            ))),
        }
    }
}
