//! Round-based reference engine
//!
//! Every round each party broadcasts one message and sends one direct message
//! to every other party. A party moves to the next round once it holds the
//! broadcast and the direct message of every other party for the current one.

use super::{async_trait, Engine, Outgoing};
use crate::{Error, Message, PartyId, Result, RoundNumber};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Protocol name stamped on every message
pub const PROTOCOL: &str = "mesh/rounds";

/// Messages received in one round, keyed by sender
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundRecord {
    /// Broadcast payloads
    pub broadcasts: BTreeMap<PartyId, Vec<u8>>,
    /// Direct payloads addressed to this party
    pub direct: BTreeMap<PartyId, Vec<u8>>,
}

impl RoundRecord {
    fn is_complete(&self, others: &BTreeSet<PartyId>) -> bool {
        others
            .iter()
            .all(|id| self.broadcasts.contains_key(id) && self.direct.contains_key(id))
    }
}

/// Everything a party received over a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    /// Completed rounds
    pub rounds: BTreeMap<RoundNumber, RoundRecord>,
}

/// Deterministic multi-round engine
pub struct RoundEngine {
    id: PartyId,
    others: BTreeSet<PartyId>,
    rounds: RoundNumber,
    ssid: Vec<u8>,
    /// Round currently being collected; `rounds + 1` once finished
    current: RoundNumber,
    /// Rounds not yet completed, including early arrivals for later rounds
    pending: BTreeMap<RoundNumber, RoundRecord>,
    transcript: Transcript,
    outgoing_tx: Option<mpsc::UnboundedSender<Message>>,
    outgoing_rx: Option<Outgoing>,
}

impl RoundEngine {
    /// Create an engine and emit the first round
    pub fn new(
        id: PartyId,
        parties: impl IntoIterator<Item = PartyId>,
        rounds: RoundNumber,
        ssid: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        if rounds == 0 {
            return Err(Error::InvalidConfig("at least one round is required".into()));
        }

        let others: BTreeSet<PartyId> = parties.into_iter().filter(|p| p != &id).collect();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut engine = Self {
            id,
            others,
            rounds,
            ssid: ssid.into(),
            current: 1,
            pending: BTreeMap::new(),
            transcript: Transcript::default(),
            outgoing_tx: Some(tx),
            outgoing_rx: Some(rx),
        };

        info!(
            party = %engine.id,
            peers = engine.others.len(),
            rounds,
            "Starting round engine"
        );

        engine.emit(1)?;
        engine.advance()?;
        Ok(engine)
    }

    /// Broadcast payload sent by `from` in `round`
    pub fn broadcast_payload(from: &PartyId, round: RoundNumber) -> Vec<u8> {
        format!("{}/r{}/broadcast", from, round).into_bytes()
    }

    /// Direct payload sent by `from` to `to` in `round`
    pub fn direct_payload(from: &PartyId, to: &PartyId, round: RoundNumber) -> Vec<u8> {
        format!("{}->{}/r{}", from, to, round).into_bytes()
    }

    /// Check if every round has completed
    pub fn is_finished(&self) -> bool {
        self.current > self.rounds
    }

    /// Round currently being collected
    pub fn round(&self) -> RoundNumber {
        self.current
    }

    /// Transcript of a finished run
    pub fn result(&self) -> Result<Transcript> {
        if !self.is_finished() {
            return Err(Error::Engine(format!(
                "protocol incomplete: party {} stuck in round {} of {}",
                self.id, self.current, self.rounds
            )));
        }
        Ok(self.transcript.clone())
    }

    fn emit(&self, round: RoundNumber) -> Result<()> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or_else(|| Error::Engine("outgoing source already closed".into()))?;

        let mut messages = Vec::with_capacity(self.others.len() + 1);
        messages.push(
            Message::broadcast(self.id.clone(), round, Self::broadcast_payload(&self.id, round))
                .with_session(self.ssid.clone(), PROTOCOL),
        );
        for to in &self.others {
            messages.push(
                Message::unicast(
                    self.id.clone(),
                    to.clone(),
                    round,
                    Self::direct_payload(&self.id, to, round),
                )
                .with_session(self.ssid.clone(), PROTOCOL),
            );
        }

        for message in messages {
            tx.send(message)
                .map_err(|_| Error::Engine("outgoing source dropped".into()))?;
        }
        debug!(party = %self.id, round, "Round messages emitted");
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        while !self.is_finished() {
            let complete = self
                .pending
                .get(&self.current)
                .map_or(self.others.is_empty(), |record| record.is_complete(&self.others));
            if !complete {
                break;
            }

            let record = self.pending.remove(&self.current).unwrap_or_default();
            self.transcript.rounds.insert(self.current, record);
            debug!(party = %self.id, round = self.current, "Round complete");

            self.current += 1;
            if self.is_finished() {
                // Closing the source tells the driving loop we are done
                self.outgoing_tx = None;
                info!(party = %self.id, rounds = self.rounds, "Round engine finished");
            } else {
                self.emit(self.current)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for RoundEngine {
    fn take_outgoing(&mut self) -> Option<Outgoing> {
        self.outgoing_rx.take()
    }

    async fn accept(&mut self, message: Message) -> Result<()> {
        if self.is_finished() {
            return Err(Error::Engine(format!(
                "message from {} after protocol finished",
                message.from
            )));
        }
        if message.ssid != self.ssid {
            return Err(Error::Engine(format!(
                "message from {} for foreign session",
                message.from
            )));
        }
        if !self.others.contains(&message.from) {
            return Err(Error::UnknownParty(message.from));
        }
        if message.round == 0 || message.round > self.rounds {
            return Err(Error::Engine(format!(
                "round {} out of range 1..={}",
                message.round, self.rounds
            )));
        }
        if message.round < self.current {
            return Err(Error::Engine(format!(
                "stale round {} message from {}",
                message.round, message.from
            )));
        }
        if !message.broadcast && message.to.as_ref() != Some(&self.id) {
            return Err(Error::Engine(format!(
                "direct message from {} not addressed to {}",
                message.from, self.id
            )));
        }

        let record = self.pending.entry(message.round).or_default();
        let slot = if message.broadcast {
            &mut record.broadcasts
        } else {
            &mut record.direct
        };
        if slot.contains_key(&message.from) {
            return Err(Error::Engine(format!(
                "duplicate round {} message from {}",
                message.round, message.from
            )));
        }
        slot.insert(message.from, message.data);

        self.advance()
    }
}
