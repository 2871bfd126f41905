//! # MPC Mesh Core
//!
//! Shared vocabulary for the peer-to-peer transport that carries the round
//! messages of threshold protocols (key generation, pre-signing, signing)
//! between a fixed set of named parties.
//!
//! This crate provides:
//! - Party identities and the protocol [`Message`]
//! - The static [`PeerTable`] of participants and their addresses
//! - The [`Engine`](engine::Engine) boundary a protocol state machine implements
//! - A deterministic [`RoundEngine`](engine::RoundEngine) for exercising transports
//!
//! ## Example
//!
//! ```rust,ignore
//! use mpc_mesh_core::{engine::RoundEngine, PeerTable};
//!
//! let peers = PeerTable::from_specs("alice".into(), "127.0.0.1:8080", ["bob:127.0.0.1:8081"])?;
//! let engine = RoundEngine::new("alice".into(), peers.ids(), 3, b"session-1".to_vec())?;
//! ```

pub mod engine;
pub mod error;
pub mod peers;
pub mod types;

pub use error::{Error, Result};
pub use peers::{parse_peer_spec, PeerTable};
pub use types::{Message, PartyId, RoundNumber};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
