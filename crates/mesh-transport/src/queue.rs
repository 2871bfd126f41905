//! Bounded inbound queues

use mpc_mesh_core::{Message, PartyId};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Consumer side of a party's inbound queue
///
/// Cloning shares the same underlying queue. `recv` yields `None` once the
/// queue has been closed by `done` or `quit` and its backlog is drained.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    party: PartyId,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl InboundQueue {
    /// Party this queue belongs to
    pub fn party(&self) -> &PartyId {
        &self.party
    }

    /// Wait for the next message
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Take the next message if one is ready
    ///
    /// Also returns `None` while another clone of this handle is waiting in
    /// [`recv`](Self::recv), since that clone holds the receiver. Use one
    /// consumer per queue when polling.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// Producer side kept by the transport, paired with the consumer handle
#[derive(Debug)]
pub(crate) struct QueueEntry {
    tx: mpsc::Sender<Message>,
    handle: InboundQueue,
}

/// Outcome of offering a message to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    Queued,
    Full,
    Closed,
}

impl QueueEntry {
    pub(crate) fn new(party: PartyId, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            handle: InboundQueue {
                party,
                rx: Arc::new(Mutex::new(rx)),
            },
        }
    }

    pub(crate) fn handle(&self) -> InboundQueue {
        self.handle.clone()
    }

    /// Enqueue without waiting; a full queue drops the newest message
    pub(crate) fn offer(&self, message: Message) -> Offer {
        match self.tx.try_send(message) {
            Ok(()) => Offer::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }
}
