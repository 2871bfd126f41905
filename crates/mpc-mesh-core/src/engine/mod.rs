//! Protocol engine boundary
//!
//! The transport only ever talks to a protocol state machine through this
//! trait: it drains the engine's outgoing messages and feeds it incoming
//! ones. Round logic and result retrieval stay inside the engine.

use crate::{Message, Result};
use tokio::sync::mpsc;

pub use ::async_trait::async_trait;

/// Source of messages produced by an engine
///
/// The channel closing is the engine's signal that it has nothing more to send.
pub type Outgoing = mpsc::UnboundedReceiver<Message>;

/// Protocol state machine driven by the transport
#[async_trait]
pub trait Engine: Send {
    /// Detach the outgoing message source
    ///
    /// Returns `None` once the source has already been taken.
    fn take_outgoing(&mut self) -> Option<Outgoing>;

    /// Accept an incoming message
    async fn accept(&mut self, message: Message) -> Result<()>;
}

/// Deterministic multi-round engine for exercising the transport
pub mod rounds;

pub use rounds::{RoundEngine, RoundRecord, Transcript};
