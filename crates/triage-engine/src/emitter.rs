use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use triage_core::events::PipelineEvent;

/// Sends pipeline events to at most one consumer. Never drops and never blocks.
#[derive(Clone, Debug, Default)]
pub struct Emitter {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl Emitter {
    pub fn channel() -> (Emitter, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Emitter { tx: Some(tx) },
            EventStream {
                inner: UnboundedReceiverStream::new(rx),
                finished: false,
            },
        )
    }

    /// An emitter with no consumer.
    pub fn disabled() -> Emitter {
        Emitter { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).is_err() {
            debug!("event receiver closed");
        }
    }
}

/// Finite stream of pipeline events. Ends after a terminal event or when every emitter is dropped.
#[derive(Debug)]
pub struct EventStream {
    inner: UnboundedReceiverStream<PipelineEvent>,
    finished: bool,
}

impl Stream for EventStream {
    type Item = PipelineEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
