//! Subscriber side of a job's progress channel.
//!
//! [`ProgressStream`] is lazy, finite and not restartable: it yields events
//! in the order the worker emitted them and ends right after the terminal
//! `complete`/`error` event. Events emitted before the subscriber attached
//! are buffered in the channel, so nothing is lost to a late subscriber.

use crate::job::JobId;
use crate::progress::ProgressEvent;
use futures::stream::StreamExt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

/// A boxed stream of server-sent-event frames.
pub type SseStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Ordered progress events of one job, ending after the terminal event.
pub struct ProgressStream {
    job_id: JobId,
    inner: UnboundedReceiverStream<ProgressEvent>,
    finished: bool,
}

impl ProgressStream {
    pub(crate) fn new(job_id: JobId, rx: UnboundedReceiver<ProgressEvent>) -> Self {
        Self {
            job_id,
            inner: UnboundedReceiverStream::new(rx),
            finished: false,
        }
    }

    /// A stream that yields `event` and ends.
    pub(crate) fn replay(job_id: JobId, event: ProgressEvent) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let _ = tx.send(event);
        Self::new(job_id, rx)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Render every event as a `data: {json}\n\n` frame.
    pub fn into_sse(self) -> SseStream {
        Box::pin(self.map(|event| event.to_sse()))
    }

    /// Drain the stream, returning every event including the terminal one.
    pub async fn collect_all(self) -> Vec<ProgressEvent> {
        self.collect().await
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
