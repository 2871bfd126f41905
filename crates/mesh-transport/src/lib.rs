//! # Mesh Transport
//!
//! Point-to-point TCP transport for the round messages of MPC protocols.
//!
//! Every party listens on one address and dials every other party. Messages
//! are newline-framed; inbound frames are routed into bounded per-party
//! queues, and a driving loop pumps messages between a protocol engine and
//! the transport.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mesh_transport::{run_party, Transport, TransportConfig};
//! use mpc_mesh_core::{engine::RoundEngine, PeerTable};
//!
//! let peers = PeerTable::from_specs("alice".into(), "127.0.0.1:8080", ["bob:127.0.0.1:8081"])?;
//! let transport = Transport::new(peers.clone(), TransportConfig::default())?;
//! transport.listen(peers.local_addr()).await?;
//! transport.connect_all();
//! transport.wait_for_peers(Duration::from_secs(30)).await?;
//!
//! let mut engine = RoundEngine::new("alice".into(), peers.ids(), 3, b"session".to_vec())?;
//! run_party(peers.local_id(), &mut engine, &transport).await?;
//! transport.done(peers.local_id());
//! ```

pub mod config;
mod connection;
pub mod driver;
pub mod latch;
pub mod queue;
mod router;
pub mod stats;
pub mod transport;

pub use config::TransportConfig;
pub use driver::run_party;
pub use latch::DoneLatch;
pub use mesh_codec::Framing;
pub use queue::InboundQueue;
pub use stats::StatsSnapshot;
pub use transport::Transport;
