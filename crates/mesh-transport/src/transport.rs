//! Transport facade
//!
//! Owns the connection map and the inbound-queue map behind a single lock.
//! Critical sections only touch those maps; socket I/O always happens after
//! the lock is released.

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::latch::DoneLatch;
use crate::queue::{InboundQueue, QueueEntry};
use crate::router::{self, DropReason, Routing};
use crate::stats::{StatsSnapshot, TransportStats};
use mpc_mesh_core::{Error, Message, PartyId, PeerTable, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Mutable transport state, only ever touched under the lock
pub(crate) struct State {
    pub(crate) peers: PeerTable,
    pub(crate) connections: HashMap<PartyId, Connection>,
    pub(crate) queues: HashMap<PartyId, QueueEntry>,
    /// Parties with a dial task in flight
    pub(crate) dialing: HashSet<PartyId>,
    /// Per-party cancellation, fired by `done` and `quit`
    pub(crate) cancels: HashMap<PartyId, CancellationToken>,
    /// Parties that reported completion
    pub(crate) finished: HashSet<PartyId>,
    next_epoch: u64,
    latch_closed: bool,
}

impl State {
    pub(crate) fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Remote parties that are still expected to be connected
    fn unconnected(&self) -> Vec<PartyId> {
        self.peers
            .remote_ids()
            .filter(|id| !self.finished.contains(*id) && !self.connections.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Close the latch if nothing is left; true only for the closing call
    fn settle(&mut self) -> bool {
        let all_finished = self
            .peers
            .ids()
            .iter()
            .all(|id| self.finished.contains(id));
        if self.latch_closed || !all_finished || !self.queues.is_empty() || !self.connections.is_empty() {
            return false;
        }
        self.latch_closed = true;
        true
    }
}

pub(crate) struct Shared {
    pub(crate) local_id: PartyId,
    pub(crate) config: TransportConfig,
    pub(crate) state: Mutex<State>,
    pub(crate) stats: TransportStats,
    /// Root of every background task's cancellation
    pub(crate) shutdown: CancellationToken,
    done_tx: watch::Sender<bool>,
    /// Bumped whenever the connection set changes
    changes: watch::Sender<u64>,
}

/// How a party leaves the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// The party reported completion (`done`)
    Finished,
    /// The party was pruned from the peer set (`quit`)
    Removed,
}

/// Peer-to-peer transport shared by the connection manager, the router and
/// the driving loops of local parties
///
/// Cloning is cheap; every clone refers to the same transport.
#[derive(Clone)]
pub struct Transport {
    pub(crate) shared: Arc<Shared>,
}

impl Transport {
    /// Create a transport for the parties in `peers`
    ///
    /// An inbound queue is created for every hosted identity. Nothing is
    /// bound or dialed until [`listen`](Self::listen) and
    /// [`connect_all`](Self::connect_all) are called.
    pub fn new(peers: PeerTable, config: TransportConfig) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let queues = peers
            .hosted_ids()
            .map(|id| (id.clone(), QueueEntry::new(id.clone(), config.queue_capacity)))
            .collect();
        let cancels = peers
            .remote_ids()
            .map(|id| (id.clone(), shutdown.child_token()))
            .collect();
        let (done_tx, _) = watch::channel(false);
        let (changes, _) = watch::channel(0);

        info!(
            party = %peers.local_id(),
            parties = peers.len(),
            framing = %config.framing,
            queue_capacity = config.queue_capacity,
            "Transport created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                local_id: peers.local_id().clone(),
                config,
                state: Mutex::new(State {
                    peers,
                    connections: HashMap::new(),
                    queues,
                    dialing: HashSet::new(),
                    cancels,
                    finished: HashSet::new(),
                    next_epoch: 0,
                    latch_closed: false,
                }),
                stats: TransportStats::default(),
                shutdown,
                done_tx,
                changes,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_change(&self) {
        self.shared.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Local identity
    pub fn local_id(&self) -> &PartyId {
        &self.shared.local_id
    }

    /// Active configuration
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Parties still taking part in the run, sorted
    pub fn parties(&self) -> Vec<PartyId> {
        self.lock().peers.ids()
    }

    /// Remote parties with an open outbound connection, sorted
    pub fn connected_peers(&self) -> Vec<PartyId> {
        let mut ids: Vec<PartyId> = self.lock().connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Process-wide completion latch
    pub fn latch(&self) -> DoneLatch {
        DoneLatch::new(self.shared.done_tx.subscribe())
    }

    /// Wait until every remote party still in the run is connected
    pub async fn wait_for_peers(&self, timeout: Duration) -> Result<()> {
        let mut changes = self.shared.changes.subscribe();
        let wait = async {
            loop {
                let ready = self.lock().unconnected().is_empty();
                if ready {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            let pending = self.lock().unconnected();
            Error::Timeout(format!("connections to {:?}", pending))
        })
    }

    /// Send a message to every connected peer it is addressed to
    ///
    /// Write failures tear the affected connection down and schedule a
    /// redial; they do not stop delivery to the other recipients. Delivery is
    /// best effort: recipients without a connection miss the message.
    #[instrument(skip(self, message), fields(from = %message.from, round = message.round))]
    pub async fn send(&self, message: &Message) -> Result<()> {
        message.validate()?;
        let line = self.shared.config.framing.encode(message)?;
        if line.len() > self.shared.config.max_frame_len {
            return Err(Error::Frame(format!(
                "frame of {} bytes exceeds limit of {}",
                line.len(),
                self.shared.config.max_frame_len
            )));
        }

        let (targets, unconnected, local) = {
            let state = self.lock();
            let targets: Vec<(PartyId, Connection)> = state
                .connections
                .iter()
                .filter(|(id, _)| message.is_for(id))
                .map(|(id, conn)| (id.clone(), conn.clone()))
                .collect();
            let unconnected: Vec<PartyId> = state
                .peers
                .remote_ids()
                .filter(|id| message.is_for(id) && !state.connections.contains_key(*id))
                .cloned()
                .collect();
            // Identities hosted in this process are served without a socket
            let local = if state.peers.hosted_ids().any(|id| message.is_for(id)) {
                Some(router::route(&state.queues, message.clone()))
            } else {
                None
            };
            (targets, unconnected, local)
        };

        if let Some(routing) = local {
            self.record_routing(&message.from, routing);
        }
        for id in &unconnected {
            self.shared.stats.unsent_not_connected.inc();
            warn!(to = %id, "Peer not connected, message not sent");
        }

        let writes = targets
            .iter()
            .map(|(id, conn)| self.write_frame(id, conn, &line));
        futures_util::future::join_all(writes).await;

        trace!(recipients = targets.len(), "Message sent");
        Ok(())
    }

    /// Inbound queue for `id`, created if absent
    pub fn next(&self, id: &PartyId) -> InboundQueue {
        let mut state = self.lock();
        if let Some(entry) = state.queues.get(id) {
            return entry.handle();
        }

        debug!(party = %id, "Creating inbound queue");
        let entry = QueueEntry::new(id.clone(), self.shared.config.queue_capacity);
        let handle = entry.handle();
        state.queues.insert(id.clone(), entry);
        handle
    }

    /// Inbound queue for a party still taking part in the run
    ///
    /// Unlike [`next`](Self::next), never revives the queue of a party that
    /// already left through `done` or `quit`.
    pub(crate) fn queue_for(&self, id: &PartyId) -> Result<InboundQueue> {
        let mut state = self.lock();
        if !state.peers.contains(id) || state.finished.contains(id) {
            return Err(Error::QueueClosed(id.clone()));
        }
        let capacity = self.shared.config.queue_capacity;
        let entry = state
            .queues
            .entry(id.clone())
            .or_insert_with(|| QueueEntry::new(id.clone(), capacity));
        Ok(entry.handle())
    }

    /// Mark `id` finished: close its queue and connection
    ///
    /// Closes the process-wide latch once nothing is left. Returns the latch
    /// so callers can wait for global completion. Calling it again is a no-op.
    pub fn done(&self, id: &PartyId) -> DoneLatch {
        self.depart(id, Departure::Finished);
        self.latch()
    }

    /// Remove `id` from the run without waiting for it to finish
    ///
    /// Stops any dial attempt, closes its connection and queue, and makes the
    /// router drop further frames from it. Calling it again is a no-op.
    pub fn quit(&self, id: &PartyId) {
        self.depart(id, Departure::Removed);
    }

    fn depart(&self, id: &PartyId, departure: Departure) {
        let (queue, connection, cancel, closed) = {
            let mut state = self.lock();
            match departure {
                Departure::Finished => {
                    if state.peers.contains(id) {
                        state.finished.insert(id.clone());
                    }
                }
                Departure::Removed => {
                    state.peers.remove(id);
                }
            }
            state.dialing.remove(id);
            let queue = state.queues.remove(id);
            let connection = state.connections.remove(id);
            let cancel = state.cancels.remove(id);
            let closed = state.settle();
            (queue, connection, cancel, closed)
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let had_connection = connection.is_some();
        if let Some(connection) = connection {
            connection.close();
        }
        let had_queue = queue.is_some();
        drop(queue);
        self.notify_change();

        if had_queue || had_connection {
            info!(party = %id, ?departure, "Party left the run");
        }
        if closed {
            self.shared.done_tx.send_replace(true);
            self.shared.shutdown.cancel();
            info!(party = %self.shared.local_id, "All parties finished");
        }
    }

    /// Stop the listener, readers and dial tasks, and close every connection
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let connections: Vec<Connection> = {
            let mut state = self.lock();
            state.dialing.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for connection in connections {
            connection.close();
        }
        self.notify_change();
        info!(party = %self.shared.local_id, "Transport shut down");
    }

    /// Route a decoded inbound message
    pub(crate) fn deliver(&self, message: Message) {
        let from = message.from.clone();
        let routing = {
            let state = self.lock();
            if !state.peers.contains(&from) {
                None
            } else {
                Some(router::route(&state.queues, message))
            }
        };

        match routing {
            Some(routing) => self.record_routing(&from, routing),
            None => {
                self.shared.stats.dropped_unknown_sender.inc();
                warn!(from = %from, "Dropping message from party outside the run");
            }
        }
    }

    fn record_routing(&self, from: &PartyId, routing: Routing) {
        let stats = &self.shared.stats;
        stats.delivered.add(routing.delivered.len() as u64);
        for to in &routing.delivered {
            trace!(from = %from, to = %to, "Message queued");
        }

        for (to, reason) in routing.dropped {
            let to = to.map(|id| id.to_string()).unwrap_or_default();
            match reason {
                DropReason::QueueFull => {
                    stats.dropped_queue_full.inc();
                    warn!(from = %from, to = %to, "Queue full, message dropped");
                }
                DropReason::NoRecipient => {
                    stats.dropped_no_recipient.inc();
                    warn!(from = %from, to = %to, "No queue for recipient, message dropped");
                }
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_id", &self.shared.local_id)
            .finish_non_exhaustive()
    }
}
