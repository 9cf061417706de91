use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use troupe_core::events::{AgentEvent, EventEnvelope};
use troupe_core::trace::Response;

use crate::error::EngineError;

/// Sending half of a call's event stream. Assigns sequence numbers.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    seq: Arc<AtomicU64>,
    receiver_gone: Arc<AtomicBool>,
}

impl EventSink {
    /// A sink whose first event gets sequence number `start_seq`.
    pub fn channel(start_seq: u64) -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            seq: Arc::new(AtomicU64::new(start_seq)),
            receiver_gone: Arc::new(AtomicBool::new(false)),
        };
        (sink, rx)
    }

    /// Emit an event and return its sequence number.
    pub fn emit(&self, event: AgentEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let event_type = event.event_type();
        if self.tx.send(EventEnvelope { seq, event }).is_err()
            && !self.receiver_gone.swap(true, Ordering::SeqCst)
        {
            warn!(event_type, seq, "no event receiver, dropping events");
        }
        seq
    }

    /// Sequence number the next event will get.
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

pin_project! {
    /// Live, ordered events of one call, ending with exactly one terminal event.
    pub struct AgentStream {
        #[pin]
        inner: UnboundedReceiverStream<EventEnvelope>,
        cancel: CancellationToken,
        handle: Option<JoinHandle<Result<Response, EngineError>>>,
        finished: bool,
    }
}

impl AgentStream {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<EventEnvelope>,
        cancel: CancellationToken,
        handle: JoinHandle<Result<Response, EngineError>>,
    ) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            cancel,
            handle: Some(handle),
            finished: false,
        }
    }

    /// Request cancellation. The stream still ends with its terminal event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream and return the call's outcome.
    pub async fn into_response(mut self) -> Result<Response, EngineError> {
        while self.next().await.is_some() {}
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| EngineError::Internal(format!("run task failed: {e}")))?,
            None => Err(EngineError::Internal("run outcome already taken".into())),
        }
    }
}

impl Stream for AgentStream {
    type Item = EventEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(envelope)) => {
                if envelope.event.is_terminal() {
                    *this.finished = true;
                }
                Poll::Ready(Some(envelope))
            }
            Poll::Ready(None) => {
                *this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
