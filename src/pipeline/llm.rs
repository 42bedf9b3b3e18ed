//! Model invocation seam.
//!
//! Every stage talks to the model through [`ModelInvoker`]: one physical
//! request in, one reply with a [`StopReason`] out. Continuation, parsing and
//! recovery live above this trait; retry/backoff for transient transport
//! errors lives below it, in [`EdgequakeInvoker`].
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids thundering-herd: with 500 ms base and 3 retries the wait sequence
//! is 500 ms → 1 s → 2 s.

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, ModelError};
use crate::pipeline::render::PageImage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation. Only user turns carry images.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    /// `(label, image)` pairs rendered after `text`, in order.
    pub images: Vec<(String, PageImage)>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<(String, PageImage)>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// Characters this turn contributes to the transcript (images excluded).
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the answer.
    Complete,
    /// Cut off by the output-token limit; a continuation is needed.
    LengthLimited,
}

impl StopReason {
    /// Map a provider `finish_reason` to a stop reason.
    ///
    /// Providers disagree on spelling (`length`, `max_tokens`, `MAX_TOKENS`);
    /// anything that is not a length signal counts as complete.
    pub fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason.map(|r| r.trim().to_ascii_lowercase()) {
            Some(r) if r == "length" || r == "max_tokens" || r == "max_output_tokens" => {
                StopReason::LengthLimited
            }
            _ => StopReason::Complete,
        }
    }
}

/// Which model a request is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelTier {
    /// Extraction, synthesis, classification.
    #[default]
    Primary,
    /// Cheap, short answers (focus summaries).
    Fast,
}

/// One physical model request.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system: Option<&'a str>,
    pub turns: &'a [Turn],
    pub tier: ModelTier,
    /// Output token budget override; `None` uses the invoker's default.
    pub max_tokens: Option<usize>,
}

/// Reply to one physical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub text: String,
    pub stop_reason: StopReason,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl ModelReply {
    /// Convenience for doubles and adapters without token accounting.
    pub fn new(text: impl Into<String>, stop_reason: StopReason) -> Self {
        Self {
            text: text.into(),
            stop_reason,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// `invoke(systemPrompt?, conversationTurns, images?) -> {text, stopReason}`.
///
/// Implementations are expected to handle their own transport retries; any
/// error returned here is final for this request.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError>;
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// [`ModelInvoker`] backed by edgequake-llm providers.
pub struct EdgequakeInvoker {
    primary: Arc<dyn LLMProvider>,
    fast: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl EdgequakeInvoker {
    pub fn new(primary: Arc<dyn LLMProvider>, fast: Option<Arc<dyn LLMProvider>>, config: &AnalysisConfig) -> Self {
        let fast = fast.unwrap_or_else(|| Arc::clone(&primary));
        Self {
            primary,
            fast,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Resolve providers from the config, most-specific first.
    ///
    /// 1. Pre-built providers (`config.provider` / `config.fast_provider`).
    /// 2. Named provider + model via [`ProviderFactory::create_llm_provider`].
    /// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` from the environment.
    /// 4. Full auto-detection with [`ProviderFactory::from_env`].
    pub fn from_config(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let primary = match config.provider {
            Some(ref p) => Arc::clone(p),
            None => resolve_provider(config, config.model.as_deref())?,
        };
        let fast = match (&config.fast_provider, &config.fast_model) {
            (Some(p), _) => Some(Arc::clone(p)),
            (None, Some(model)) if config.provider.is_none() => {
                Some(resolve_provider(config, Some(model))?)
            }
            _ => None,
        };
        Ok(Self::new(primary, fast, config))
    }

    fn to_messages(request: &ModelRequest<'_>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        if let Some(system) = request.system {
            messages.push(ChatMessage::system(system));
        }
        for turn in request.turns {
            match turn.role {
                Role::Assistant => messages.push(ChatMessage::assistant(turn.text.as_str())),
                Role::User if turn.images.is_empty() => {
                    messages.push(ChatMessage::user(turn.text.as_str()))
                }
                Role::User => {
                    // Page labels are inlined into the text so they precede the
                    // images in the same order the images are attached.
                    let labels: Vec<&str> = turn.images.iter().map(|(l, _)| l.as_str()).collect();
                    let text = format!("{}\n{}", turn.text, labels.join("\n"));
                    let images = turn
                        .images
                        .iter()
                        .map(|(_, img)| {
                            ImageData::new(img.data.clone(), img.mime_type.as_str()).with_detail("high")
                        })
                        .collect();
                    messages.push(ChatMessage::user_with_images(text, images));
                }
            }
        }
        messages
    }
}

#[async_trait]
impl ModelInvoker for EdgequakeInvoker {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        let provider = match request.tier {
            ModelTier::Primary => &self.primary,
            ModelTier::Fast => &self.fast,
        };
        let messages = Self::to_messages(&request);
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens)),
            ..Default::default()
        };

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Model call: retry {}/{} after {}ms",
                    attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    let stop_reason = StopReason::from_finish_reason(response.finish_reason.as_deref());
                    debug!(
                        "Model call: {} input tokens, {} output tokens, stop={:?}",
                        response.prompt_tokens, response.completion_tokens, stop_reason
                    );
                    return Ok(ModelReply {
                        text: response.content,
                        stop_reason,
                        input_tokens: response.prompt_tokens,
                        output_tokens: response.completion_tokens,
                    });
                }
                Err(e) => {
                    let err_msg = format!("{}", e);
                    warn!("Model call: attempt {} failed: {}", attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(ModelError::Transport(
            last_err.unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, AnalysisError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        AnalysisError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn resolve_provider(
    config: &AnalysisConfig,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, AnalysisError> {
    if let Some(ref name) = config.provider_name {
        let model = model.unwrap_or("claude-sonnet-4-20250514");
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, model.unwrap_or(&env_model));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| AnalysisError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set ANTHROPIC_API_KEY, OPENAI_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
