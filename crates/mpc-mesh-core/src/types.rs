//! Core types for the mesh transport

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Unique, human-readable identifier for a party in the MPC network
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    /// Create a new party ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty identifier, which never names a party
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PartyId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for PartyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Round number carried by every protocol message
pub type RoundNumber = u32;

/// A protocol message as handed between the engine and the transport
///
/// A message is either addressed to exactly one recipient (`broadcast == false`,
/// `to` set) or to every other party (`broadcast == true`, `to` ignored).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Session identifier
    pub ssid: Vec<u8>,
    /// Sender party ID
    pub from: PartyId,
    /// Receiver party ID (None for broadcasts)
    pub to: Option<PartyId>,
    /// Protocol name, e.g. `cmp/keygen`
    pub protocol: String,
    /// Round number
    pub round: RoundNumber,
    /// Opaque payload
    pub data: Vec<u8>,
    /// Whether the message goes to every other party
    pub broadcast: bool,
}

impl Message {
    /// Create a message addressed to a single party
    pub fn unicast(from: PartyId, to: PartyId, round: RoundNumber, data: Vec<u8>) -> Self {
        Self {
            ssid: Vec::new(),
            from,
            to: Some(to),
            protocol: String::new(),
            round,
            data,
            broadcast: false,
        }
    }

    /// Create a message addressed to every party except the sender
    pub fn broadcast(from: PartyId, round: RoundNumber, data: Vec<u8>) -> Self {
        Self {
            ssid: Vec::new(),
            from,
            to: None,
            protocol: String::new(),
            round,
            data,
            broadcast: true,
        }
    }

    /// Attach session metadata
    pub fn with_session(mut self, ssid: impl Into<Vec<u8>>, protocol: impl Into<String>) -> Self {
        self.ssid = ssid.into();
        self.protocol = protocol.into();
        self
    }

    /// Whether `id` should receive this message
    pub fn is_for(&self, id: &PartyId) -> bool {
        if self.broadcast {
            return &self.from != id;
        }
        self.to.as_ref() == Some(id)
    }

    /// Check the addressing invariant
    pub fn validate(&self) -> Result<()> {
        if self.from.is_empty() {
            return Err(Error::InvalidMessage("empty sender".into()));
        }
        if self.broadcast {
            return Ok(());
        }
        match &self.to {
            None => Err(Error::MissingRecipient(self.from.clone())),
            Some(to) if to.is_empty() => Err(Error::MissingRecipient(self.from.clone())),
            Some(to) if to == &self.from => Err(Error::InvalidMessage(format!(
                "unicast from {} addressed to itself",
                self.from
            ))),
            Some(_) => Ok(()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.to, self.broadcast) {
            (_, true) => write!(f, "{} -> * ", self.from)?,
            (Some(to), false) => write!(f, "{} -> {} ", self.from, to)?,
            (None, false) => write!(f, "{} -> ? ", self.from)?,
        }
        write!(f, "round {} ({} bytes)", self.round, self.data.len())
    }
}
