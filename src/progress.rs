//! Progress events and the sinks that receive them.
//!
//! Stages push [`ProgressEvent`]s into a [`ProgressSink`] as they work. The
//! sink never blocks the stage: [`ChannelReporter`] forwards to an unbounded
//! channel, and a subscriber that went away is simply ignored. Whether
//! anyone is listening has no effect on what the worker persists.
//!
//! # Example
//!
//! ```rust
//! use underwrite_pipeline::{ChannelReporter, ProgressEvent, ProgressSink};
//!
//! let (reporter, mut rx) = ChannelReporter::new();
//! reporter.emit(ProgressEvent::progress("Processing pages 1-3..."));
//! reporter.emit(ProgressEvent::error("model unreachable"));
//! reporter.emit(ProgressEvent::progress("dropped: the job already ended"));
//!
//! assert!(matches!(rx.try_recv(), Ok(ProgressEvent::Progress { .. })));
//! assert!(matches!(rx.try_recv(), Ok(ProgressEvent::Error { .. })));
//! assert!(rx.try_recv().is_err());
//! ```

use crate::output::{AnalysisResult, PageRecord};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Pipeline phase that finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extraction,
    Synthesis,
}

/// One event on a job's progress stream.
///
/// Serialises with a `type` discriminator, e.g.
/// `{"type":"batch_complete","message":"…","pages":[…]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Free-text status update.
    Progress { message: String },
    /// An extraction batch finished; carries its page records.
    BatchComplete {
        message: String,
        pages: Vec<PageRecord>,
    },
    PhaseComplete { phase: Phase },
    /// Something went wrong but the job continues.
    Warning { message: String },
    /// Terminal: the job failed.
    Error { message: String },
    /// Terminal: the job finished.
    Complete {
        #[serde(rename = "data")]
        result: Box<AnalysisResult>,
    },
}

impl ProgressEvent {
    pub fn progress(message: impl Into<String>) -> Self {
        ProgressEvent::Progress {
            message: message.into(),
        }
    }

    pub fn batch_complete(message: impl Into<String>, pages: Vec<PageRecord>) -> Self {
        ProgressEvent::BatchComplete {
            message: message.into(),
            pages,
        }
    }

    pub fn phase_complete(phase: Phase) -> Self {
        ProgressEvent::PhaseComplete { phase }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ProgressEvent::Warning {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
        }
    }

    pub fn complete(result: AnalysisResult) -> Self {
        ProgressEvent::Complete {
            result: Box::new(result),
        }
    }

    /// `complete` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::BatchComplete { .. } => "batch_complete",
            ProgressEvent::PhaseComplete { .. } => "phase_complete",
            ProgressEvent::Warning { .. } => "warning",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Complete { .. } => "complete",
        }
    }

    /// Human-readable text of the event, if it has any.
    pub fn message(&self) -> Option<&str> {
        match self {
            ProgressEvent::Progress { message }
            | ProgressEvent::BatchComplete { message, .. }
            | ProgressEvent::Warning { message }
            | ProgressEvent::Error { message } => Some(message),
            ProgressEvent::PhaseComplete { .. } | ProgressEvent::Complete { .. } => None,
        }
    }

    /// Server-sent-events frame: `data: {json}\n\n`.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"event serialisation failed: {e}"}}"#)
        });
        format!("data: {json}\n\n")
    }
}

/// Receives progress events from the pipeline stages.
///
/// `emit` must return promptly; it is called inline from the worker.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Shared handle the stages hold.
pub type SharedSink = Arc<dyn ProgressSink>;

/// Discards everything.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Single-writer ordered channel with exactly one terminal event.
///
/// After the first `complete` or `error` the sender is dropped, which closes
/// the subscriber's stream; anything emitted later is discarded.
pub struct ChannelReporter {
    tx: Mutex<Option<mpsc::UnboundedSender<ProgressEvent>>>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// True once a terminal event went through.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

impl ProgressSink for ChannelReporter {
    fn emit(&self, event: ProgressEvent) {
        let Ok(mut guard) = self.tx.lock() else {
            return;
        };
        let Some(tx) = guard.as_ref() else {
            debug!("Dropping '{}' event after terminal event", event.kind());
            return;
        };
        let terminal = event.is_terminal();
        if tx.send(event).is_err() {
            debug!("Progress subscriber is gone; event discarded");
        }
        if terminal {
            guard.take();
        }
    }
}
