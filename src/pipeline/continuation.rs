//! Continuation driver: one logical model call over several physical ones.
//!
//! Models stop at their output-token limit. When a reply comes back
//! length-limited, the partial text is appended to the transcript as an
//! assistant turn, followed by a fixed "please continue" user turn, and the
//! model is asked again. Partial texts are concatenated in receipt order.
//!
//! The whole exchange is one unit of work: the timeout covers every round,
//! cancellation aborts between or during rounds, and a failure on any round
//! fails the call without returning partial text. On failure the transcript
//! is rolled back to the state the caller handed in.

use crate::error::ModelError;
use crate::pipeline::llm::{ModelInvoker, ModelRequest, ModelTier, StopReason, Turn};
use crate::prompts::CONTINUE_PROMPT;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ordered conversation turns, with a running character count.
///
/// Synthesis keeps one transcript for the whole stage so every refinement
/// sees all prior turns; extraction uses a fresh one per batch.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
    chars: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.chars += turn.text_len();
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Text characters across all turns.
    pub fn char_len(&self) -> usize {
        self.chars
    }

    /// Marker for [`Transcript::rollback`].
    pub fn checkpoint(&self) -> usize {
        self.turns.len()
    }

    /// Drop every turn pushed after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: usize) {
        for turn in self.turns.drain(checkpoint.min(self.turns.len())..) {
            self.chars -= turn.text_len();
        }
    }
}

/// Accumulator for one logical call. Lives only while the call runs.
#[derive(Debug, Default)]
pub struct ContinuationState {
    parts: Vec<String>,
    last_stop: Option<StopReason>,
    rounds: usize,
    input_tokens: u64,
    output_tokens: u64,
}

impl ContinuationState {
    fn record(&mut self, text: &str, stop: StopReason, input_tokens: usize, output_tokens: usize) {
        self.rounds += 1;
        self.last_stop = Some(stop);
        self.input_tokens += input_tokens as u64;
        self.output_tokens += output_tokens as u64;
        if !text.is_empty() {
            self.parts.push(text.to_string());
        }
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn last_stop(&self) -> Option<StopReason> {
        self.last_stop
    }

    fn finish(self) -> Completion {
        Completion {
            text: self.parts.concat(),
            rounds: self.rounds,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

/// Result of a successful logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// All partial texts, concatenated in receipt order.
    pub text: String,
    /// Physical model calls made.
    pub rounds: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Drives a [`ModelInvoker`] until a reply is not length-limited.
#[derive(Clone)]
pub struct ContinuationDriver {
    invoker: Arc<dyn ModelInvoker>,
    max_rounds: usize,
    timeout: Duration,
    cancel: CancellationToken,
    tier: ModelTier,
    max_tokens: Option<usize>,
}

impl ContinuationDriver {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        max_rounds: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            invoker,
            max_rounds: max_rounds.max(1),
            timeout,
            cancel,
            tier: ModelTier::Primary,
            max_tokens: None,
        }
    }

    /// Same driver, aimed at another model tier.
    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    /// Same driver, with a per-round output budget override.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one logical call over `transcript`.
    ///
    /// The caller pushes the initial user turn. On success every partial
    /// reply (and the continue prompts between them) stays in the transcript;
    /// on failure the transcript is rolled back to what was handed in.
    pub async fn drive(
        &self,
        system: Option<&str>,
        transcript: &mut Transcript,
    ) -> Result<Completion, ModelError> {
        if self.cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        let checkpoint = transcript.checkpoint();

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ModelError::Cancelled),
            r = tokio::time::timeout(self.timeout, self.run_rounds(system, transcript)) => {
                r.unwrap_or(Err(ModelError::Timeout { secs: self.timeout.as_secs() }))
            }
        };

        if outcome.is_err() {
            transcript.rollback(checkpoint);
        }
        outcome
    }

    async fn run_rounds(
        &self,
        system: Option<&str>,
        transcript: &mut Transcript,
    ) -> Result<Completion, ModelError> {
        let mut state = ContinuationState::default();

        loop {
            if state.rounds() == self.max_rounds {
                warn!(
                    "Continuation: still length-limited after {} rounds, giving up",
                    state.rounds()
                );
                return Err(ModelError::ContinuationExhausted {
                    rounds: state.rounds(),
                });
            }

            let reply = self
                .invoker
                .invoke(ModelRequest {
                    system,
                    turns: transcript.turns(),
                    tier: self.tier,
                    max_tokens: self.max_tokens,
                })
                .await?;

            state.record(
                &reply.text,
                reply.stop_reason,
                reply.input_tokens,
                reply.output_tokens,
            );

            // An empty reply cannot be continued meaningfully.
            if reply.text.is_empty() {
                debug!("Continuation: empty reply on round {}", state.rounds());
                break;
            }

            transcript.push(Turn::assistant(reply.text));
            match reply.stop_reason {
                StopReason::Complete => break,
                StopReason::LengthLimited => {
                    debug!(
                        "Continuation: round {} hit the length limit, continuing",
                        state.rounds()
                    );
                    transcript.push(Turn::user(CONTINUE_PROMPT));
                }
            }
        }

        Ok(state.finish())
    }
}
