//! Mesh Party CLI
//!
//! Command-line party node for the peer-to-peer transport:
//! - Multi-round protocol run over a full mesh, with optional signer pruning
//! - Interactive chat over line framing for manual testing

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use mesh_transport::config::DEFAULT_QUEUE_CAPACITY;
use mesh_transport::{run_party, Framing, StatsSnapshot, Transport, TransportConfig};
use mpc_mesh_core::engine::{RoundEngine, Transcript};
use mpc_mesh_core::{Message, PartyId, PeerTable};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

/// Mesh Party - peer-to-peer MPC party node
#[derive(Parser)]
#[command(name = "mesh-party")]
#[command(about = "Peer-to-peer MPC transport party node")]
#[command(version)]
struct Cli {
    /// This party's ID
    #[arg(short, long, env = "PARTY_ID")]
    id: String,

    /// Listen address
    #[arg(short, long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Remote party as id:host:port (repeatable)
    #[arg(short, long = "peer", env = "PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Messages buffered per inbound queue
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Pause between dial attempts, in milliseconds
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 5000)]
    retry_backoff_ms: u64,

    /// Seconds to wait for every peer to connect
    #[arg(long, env = "CONNECT_TIMEOUT", default_value_t = 120)]
    connect_timeout: u64,

    /// Emit logs as JSON
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the multi-round protocol with every connected party
    Rounds {
        /// Number of rounds
        #[arg(short, long, default_value_t = 3)]
        rounds: u32,

        /// Participating party IDs (comma-separated, default all)
        #[arg(short, long, value_delimiter = ',')]
        signers: Vec<String>,

        /// Session identifier shared by every party
        #[arg(long, default_value = "mesh-session")]
        session: String,
    },

    /// Exchange text lines with other parties
    Chat,
}

/// Printed once a protocol run completes
#[derive(Serialize)]
struct RunSummary<'a> {
    party: &'a PartyId,
    session: String,
    signers: &'a [PartyId],
    transcript: &'a Transcript,
    stats: StatsSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let peers = PeerTable::from_specs(
        PartyId::new(cli.id.trim()),
        cli.listen.clone(),
        cli.peers.iter().map(String::as_str),
    )?;
    let config = TransportConfig::default()
        .with_queue_capacity(cli.queue_capacity)
        .with_retry_backoff(Duration::from_millis(cli.retry_backoff_ms));

    match cli.command {
        Commands::Rounds {
            rounds,
            ref signers,
            ref session,
        } => {
            run_rounds(&cli, peers, config, rounds, signers, session).await?;
        }
        Commands::Chat => {
            run_chat(&cli, peers, config.with_framing(Framing::Line)).await?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        );

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_rounds(
    cli: &Cli,
    peers: PeerTable,
    config: TransportConfig,
    rounds: u32,
    signers: &[String],
    session: &str,
) -> Result<()> {
    let local_id = peers.local_id().clone();
    let parties = peers.ids();

    let signers: Vec<PartyId> = if signers.is_empty() {
        parties.clone()
    } else {
        signers.iter().map(|s| PartyId::new(s.trim())).collect()
    };
    for signer in &signers {
        if !parties.contains(signer) {
            bail!("signer {} is not a configured party", signer);
        }
    }
    if !signers.contains(&local_id) {
        info!(party = %local_id, "Not among the signers, leaving");
        return Ok(());
    }

    let transport = Transport::new(peers, config)?;
    let address = transport.listen(&cli.listen).await?;

    for id in parties.iter().filter(|id| !signers.contains(id)) {
        transport.quit(id);
    }
    transport.connect_all();

    info!(
        party = %local_id,
        address = %address,
        signers = ?signers,
        "Waiting for peers"
    );
    transport
        .wait_for_peers(Duration::from_secs(cli.connect_timeout))
        .await?;

    info!(party = %local_id, rounds, session, "Starting protocol run");
    let mut engine = RoundEngine::new(
        local_id.clone(),
        signers.clone(),
        rounds,
        session.as_bytes().to_vec(),
    )?;
    run_party(&local_id, &mut engine, &transport).await?;
    let transcript = engine.result()?;

    let mut latch = transport.latch();
    for id in &parties {
        transport.done(id);
    }
    if tokio::time::timeout(Duration::from_secs(5), latch.wait())
        .await
        .is_err()
    {
        warn!(party = %local_id, "Transport did not drain");
    }

    let stats = transport.stats();
    info!(
        party = %local_id,
        rounds = transcript.rounds.len(),
        delivered = stats.delivered,
        dropped = stats.dropped(),
        "Protocol run completed"
    );

    let summary = RunSummary {
        party: &local_id,
        session: hex::encode(session.as_bytes()),
        signers: &signers,
        transcript: &transcript,
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

async fn run_chat(cli: &Cli, peers: PeerTable, config: TransportConfig) -> Result<()> {
    let local_id = peers.local_id().clone();
    let transport = Transport::new(peers, config)?;
    let address = transport.listen(&cli.listen).await?;
    transport.connect_all();

    info!(party = %local_id, address = %address, "Chat started");
    println!("Send with `<party> <text>`, broadcast with `* <text>`, leave with `quit`");

    let inbound = transport.next(&local_id);
    let printer = tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            println!("[{}] {}", message.from, String::from_utf8_lossy(&message.data));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }

        let Some((to, text)) = line.split_once(' ') else {
            println!("usage: <party> <text>");
            continue;
        };
        let data = text.trim().as_bytes().to_vec();
        let message = if to == "*" {
            Message::broadcast(local_id.clone(), 0, data)
        } else {
            Message::unicast(local_id.clone(), PartyId::new(to), 0, data)
        };

        if let Err(e) = transport.send(&message).await {
            println!("not sent: {}", e);
        }
    }

    transport.done(&local_id);
    transport.shutdown();
    let _ = printer.await;

    info!(party = %local_id, stats = ?transport.stats(), "Chat ended");
    Ok(())
}
