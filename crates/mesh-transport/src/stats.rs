//! Drop and traffic counters
//!
//! Queue overflow, unknown recipients and unconnected peers are expected
//! operating conditions, so they are counted rather than raised.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live counters owned by a transport
#[derive(Debug, Default)]
pub(crate) struct TransportStats {
    pub(crate) frames_received: Counter,
    pub(crate) frames_malformed: Counter,
    pub(crate) delivered: Counter,
    pub(crate) dropped_queue_full: Counter,
    pub(crate) dropped_no_recipient: Counter,
    pub(crate) dropped_unknown_sender: Counter,
    pub(crate) frames_sent: Counter,
    pub(crate) unsent_not_connected: Counter,
    pub(crate) write_failures: Counter,
    pub(crate) dial_failures: Counter,
    pub(crate) connections_established: Counter,
}

impl TransportStats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.get(),
            frames_malformed: self.frames_malformed.get(),
            delivered: self.delivered.get(),
            dropped_queue_full: self.dropped_queue_full.get(),
            dropped_no_recipient: self.dropped_no_recipient.get(),
            dropped_unknown_sender: self.dropped_unknown_sender.get(),
            frames_sent: self.frames_sent.get(),
            unsent_not_connected: self.unsent_not_connected.get(),
            write_failures: self.write_failures.get(),
            dial_failures: self.dial_failures.get(),
            connections_established: self.connections_established.get(),
        }
    }
}

/// Point-in-time copy of the transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames read off any connection
    pub frames_received: u64,
    /// Frames that failed to parse or exceeded the length limit
    pub frames_malformed: u64,
    /// Messages placed into an inbound queue (one per recipient)
    pub delivered: u64,
    /// Messages dropped because the recipient queue was full
    pub dropped_queue_full: u64,
    /// Messages dropped because no queue exists for the recipient
    pub dropped_no_recipient: u64,
    /// Messages dropped because the sender is not a participant
    pub dropped_unknown_sender: u64,
    /// Frames written to a peer connection
    pub frames_sent: u64,
    /// Outgoing copies skipped because the recipient was not connected
    pub unsent_not_connected: u64,
    /// Writes that failed and tore the connection down
    pub write_failures: u64,
    /// Failed dial attempts
    pub dial_failures: u64,
    /// Outbound connections established
    pub connections_established: u64,
}

impl StatsSnapshot {
    /// Total inbound messages lost to routing
    pub fn dropped(&self) -> u64 {
        self.dropped_queue_full + self.dropped_no_recipient + self.dropped_unknown_sender
    }
}
