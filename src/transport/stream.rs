//! Stream multiplexer
//!
//! One [`StreamHandle`] per attached GET connection. Dispatchers push into a
//! bounded FIFO queue; the connection's writer is the single consumer, so
//! concurrent pushes never interleave on the wire. State moves
//! `Open -> Draining -> Closed` and never back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::TransportError;
use crate::mcp::codec::OutboundMessage;
use crate::transport::session::{SessionId, SessionRegistry};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Draining,
    Closed,
}

enum Queued {
    Ready(OutboundMessage),
    /// Position reserved at dispatch time, filled when the engine completes.
    Pending(oneshot::Receiver<OutboundMessage>),
}

struct Shared {
    state: StreamState,
    sender: Option<mpsc::Sender<Queued>>,
}

pub struct StreamHandle {
    id: u64,
    session_id: SessionId,
    shared: Mutex<Shared>,
    closed: CancellationToken,
}

impl StreamHandle {
    pub fn open(session_id: SessionId, capacity: usize) -> (Arc<Self>, StreamReceiver) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            session_id,
            shared: Mutex::new(Shared {
                state: StreamState::Open,
                sender: Some(sender),
            }),
            closed: CancellationToken::new(),
        });

        let receiver = StreamReceiver {
            rx,
            handle: Arc::clone(&handle),
            registry: None,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    fn sender(&self) -> Result<mpsc::Sender<Queued>, TransportError> {
        let shared = self.shared.lock();
        match (&shared.state, &shared.sender) {
            (StreamState::Open, Some(sender)) => Ok(sender.clone()),
            _ => Err(TransportError::SessionClosed),
        }
    }

    async fn enqueue(&self, item: Queued) -> Result<(), TransportError> {
        let sender = self.sender()?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::SessionClosed),
            sent = sender.send(item) => sent.map_err(|_| TransportError::SessionClosed),
        }
    }

    /// Queues a message behind everything already queued. Waits for queue
    /// space; fails with `SessionClosed` once the stream stops accepting.
    pub async fn push(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.enqueue(Queued::Ready(message)).await
    }

    /// Reserves the next queue position for a message that does not exist
    /// yet. Messages queued after the slot wait for it to be filled or dropped.
    pub async fn reserve_slot(&self) -> Result<StreamSlot, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Queued::Pending(rx)).await?;
        Ok(StreamSlot { tx })
    }

    /// Stops accepting pushes; already queued messages are still written.
    pub fn drain(&self) {
        let mut shared = self.shared.lock();
        if shared.state == StreamState::Open {
            shared.state = StreamState::Draining;
            shared.sender = None;
            debug!(session_id = %self.session_id, stream_id = self.id, "stream draining");
        }
    }

    /// Terminal. Unsent messages are discarded and blocked pushers are woken.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        if shared.state != StreamState::Closed {
            shared.state = StreamState::Closed;
            shared.sender = None;
            debug!(session_id = %self.session_id, stream_id = self.id, "stream closed");
        }
        drop(shared);
        self.closed.cancel();
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

pub struct StreamSlot {
    tx: oneshot::Sender<OutboundMessage>,
}

impl StreamSlot {
    pub fn fill(self, message: OutboundMessage) -> Result<(), OutboundMessage> {
        self.tx.send(message)
    }
}

/// Consumer half of a stream, owned by the connection writer. Dropping it
/// (client went away, body finished) closes the stream and clears the
/// session's reference to it.
pub struct StreamReceiver {
    rx: mpsc::Receiver<Queued>,
    handle: Arc<StreamHandle>,
    registry: Option<SessionRegistry>,
}

impl StreamReceiver {
    pub fn notify_on_close(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn handle(&self) -> &Arc<StreamHandle> {
        &self.handle
    }

    /// Next message in queue order, or `None` once the stream is finished.
    pub async fn next_message(&mut self) -> Option<OutboundMessage> {
        loop {
            let queued = tokio::select! {
                biased;
                _ = self.handle.closed.cancelled() => return None,
                queued = self.rx.recv() => queued,
            };

            match queued {
                Some(Queued::Ready(message)) => return Some(message),
                Some(Queued::Pending(slot)) => {
                    tokio::select! {
                        biased;
                        _ = self.handle.closed.cancelled() => return None,
                        filled = slot => {
                            if let Ok(message) = filled {
                                return Some(message);
                            }
                        }
                    }
                }
                None => {
                    self.handle.close();
                    return None;
                }
            }
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(registry) = &self.registry {
            registry.detach_stream(&self.handle.session_id, self.handle.id);
        }
    }
}
