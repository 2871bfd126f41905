//! Message router
//!
//! Places decoded messages into per-party inbound queues. Broadcasts fan out
//! to every queue except the sender's. The router never blocks: a full queue
//! or a missing recipient drops the message for that recipient and reports it.

use crate::queue::{Offer, QueueEntry};
use mpc_mesh_core::{Message, PartyId};
use std::collections::HashMap;

/// Why a message did not reach a recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DropReason {
    QueueFull,
    NoRecipient,
}

/// Per-recipient outcome of routing one message
#[derive(Debug, Default)]
pub(crate) struct Routing {
    pub(crate) delivered: Vec<PartyId>,
    pub(crate) dropped: Vec<(Option<PartyId>, DropReason)>,
}

impl Routing {
    fn record(&mut self, recipient: &PartyId, offer: Offer) {
        match offer {
            Offer::Queued => self.delivered.push(recipient.clone()),
            Offer::Full => self
                .dropped
                .push((Some(recipient.clone()), DropReason::QueueFull)),
            Offer::Closed => self
                .dropped
                .push((Some(recipient.clone()), DropReason::NoRecipient)),
        }
    }
}

/// Route one message into the queue map
pub(crate) fn route(queues: &HashMap<PartyId, QueueEntry>, message: Message) -> Routing {
    let mut routing = Routing::default();

    if message.broadcast {
        for (id, entry) in queues.iter().filter(|(id, _)| **id != message.from) {
            routing.record(id, entry.offer(message.clone()));
        }
        return routing;
    }

    match message.to.clone() {
        Some(to) => match queues.get(&to) {
            Some(entry) => routing.record(&to, entry.offer(message)),
            None => routing.dropped.push((Some(to), DropReason::NoRecipient)),
        },
        None => routing.dropped.push((None, DropReason::NoRecipient)),
    }
    routing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(ids: &[&str], capacity: usize) -> HashMap<PartyId, QueueEntry> {
        ids.iter()
            .map(|id| (PartyId::from(*id), QueueEntry::new((*id).into(), capacity)))
            .collect()
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let queues = queues(&["alice", "bob", "carol"], 8);
        let routing = route(&queues, Message::broadcast("alice".into(), 1, b"r1".to_vec()));

        let mut delivered = routing.delivered.clone();
        delivered.sort();
        assert_eq!(delivered, vec![PartyId::from("bob"), PartyId::from("carol")]);
        assert!(routing.dropped.is_empty());

        let alice = queues[&PartyId::from("alice")].handle();
        assert!(alice.try_recv().is_none());
        let bob = queues[&PartyId::from("bob")].handle();
        assert_eq!(bob.try_recv().unwrap().data, b"r1");
        assert!(bob.try_recv().is_none());
    }

    #[test]
    fn test_unicast() {
        let queues = queues(&["alice", "bob"], 8);
        let routing = route(
            &queues,
            Message::unicast("alice".into(), "bob".into(), 2, vec![7]),
        );

        assert_eq!(routing.delivered, vec![PartyId::from("bob")]);
        let msg = queues[&PartyId::from("bob")].handle().try_recv().unwrap();
        assert_eq!(msg.round, 2);
        assert_eq!(msg.data, vec![7]);
    }

    #[test]
    fn test_unknown_recipient_dropped() {
        let queues = queues(&["alice"], 8);
        let routing = route(
            &queues,
            Message::unicast("bob".into(), "dave".into(), 1, vec![]),
        );

        assert!(routing.delivered.is_empty());
        assert_eq!(
            routing.dropped,
            vec![(Some(PartyId::from("dave")), DropReason::NoRecipient)]
        );
    }

    #[test]
    fn test_full_queue_reports_drop() {
        let queues = queues(&["bob"], 1);
        let first = route(&queues, Message::unicast("alice".into(), "bob".into(), 1, vec![]));
        let second = route(&queues, Message::unicast("alice".into(), "bob".into(), 2, vec![]));

        assert_eq!(first.delivered.len(), 1);
        assert_eq!(
            second.dropped,
            vec![(Some(PartyId::from("bob")), DropReason::QueueFull)]
        );
        // the oldest message is the one retained
        let msg = queues[&PartyId::from("bob")].handle().try_recv().unwrap();
        assert_eq!(msg.round, 1);
    }
}
