// Delivery channel from a queue engine to one consumer handle.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use wharf_common::PushEvent;

/// Sending half held by the authority. Cloned into every engine the handle
/// registers with, so a reopened handle keeps the same stream.
#[derive(Debug, Clone)]
pub struct PushSink {
    tx: mpsc::UnboundedSender<PushEvent>,
    // Set when the client closes the handle; engines stop routing to it.
    closed: Arc<AtomicBool>,
}

impl PushSink {
    pub fn channel() -> (PushSink, PushStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PushSink {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            PushStream { rx },
        )
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn push(&self, event: PushEvent) -> bool {
        self.is_open() && self.tx.send(event).is_ok()
    }
}

/// Receiving half handed to the client on a successful open.
#[derive(Debug)]
pub struct PushStream {
    rx: mpsc::UnboundedReceiver<PushEvent>,
}

impl PushStream {
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<PushEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wharf_common::ids::MessageGuid;
    use wharf_common::{MessageProperties, QueueUri};

    fn event() -> PushEvent {
        PushEvent {
            uri: QueueUri::new("d", "q").expect("uri"),
            guid: MessageGuid::new(),
            payload: Bytes::from_static(b"x"),
            properties: MessageProperties::default(),
        }
    }

    #[test]
    fn closed_sink_rejects_pushes() {
        let (sink, mut stream) = PushSink::channel();
        assert!(sink.push(event()));
        sink.close();
        assert!(!sink.is_open());
        assert!(!sink.push(event()));
        assert!(stream.try_recv().is_ok());
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn dropped_stream_closes_sink() {
        let (sink, stream) = PushSink::channel();
        drop(stream);
        assert!(!sink.is_open());
    }
}
