//! Error types for mesh transport operations

use crate::PartyId;
use thiserror::Error;

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while moving protocol messages between parties
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid transport or party configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Peer specification not of the form `id:host:port`
    #[error("Invalid peer specification: {0}")]
    InvalidPeerSpec(String),

    /// Party is not part of the peer table
    #[error("Unknown party: {0}")]
    UnknownParty(PartyId),

    /// Unicast message without a recipient
    #[error("Unicast message from {0} has no recipient")]
    MissingRecipient(PartyId),

    /// Message failed structural validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Local listen address could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Dial to a remote party failed
    #[error("Failed to connect to {party} at {addr}: {source}")]
    Connect {
        party: PartyId,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Frame could not be produced or parsed under the configured framing
    #[error("Frame error: {0}")]
    Frame(String),

    /// Inbound queue of a party was closed
    #[error("Inbound queue for {0} is closed")]
    QueueClosed(PartyId),

    /// Error reported by the protocol engine
    #[error("Engine error: {0}")]
    Engine(String),

    /// Timeout waiting for connectivity or completion
    #[error("Timeout waiting for {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}
