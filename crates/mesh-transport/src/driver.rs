//! Driving loop
//!
//! Pumps messages between one local party's engine and the transport until
//! the engine runs out of output.

use crate::transport::Transport;
use mpc_mesh_core::engine::Engine;
use mpc_mesh_core::{Error, Message, PartyId, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument};

/// Run `engine` for party `id` over `transport`
///
/// Outgoing messages go through a single background send pump so writes keep
/// their order while the loop keeps serving the inbound queue. Messages the
/// engine rejects are logged and skipped; the engine's own result reports the
/// failure. Returns once the engine closes its outgoing source and every
/// message it produced has been handed to the transport.
///
/// The party is not marked done here; call [`Transport::done`] once the run
/// is over.
#[instrument(skip(id, engine, transport), fields(party = %id))]
pub async fn run_party<E>(id: &PartyId, engine: &mut E, transport: &Transport) -> Result<()>
where
    E: Engine + ?Sized,
{
    let inbound = transport.queue_for(id)?;
    let mut outgoing = engine
        .take_outgoing()
        .ok_or_else(|| Error::Engine("outgoing source already taken".into()))?;
    let (pump, pump_task) = spawn_send_pump(transport.clone());

    let mut sent: u64 = 0;
    let mut received: u64 = 0;

    let outcome = loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    if pump.send(message).is_err() {
                        break Err(Error::Engine("send pump stopped".into()));
                    }
                    sent += 1;
                }
                None => {
                    debug!("Engine output exhausted");
                    break Ok(());
                }
            },
            message = inbound.recv() => match message {
                Some(message) => {
                    received += 1;
                    let (from, round) = (message.from.clone(), message.round);
                    if let Err(e) = engine.accept(message).await {
                        warn!(from = %from, round, error = %e, "Engine rejected message");
                    }
                }
                None => break Err(Error::QueueClosed(id.clone())),
            },
        }
    };

    // Let every queued send reach the transport before returning
    drop(pump);
    if let Err(e) = pump_task.await {
        warn!(error = %e, "Send pump failed");
    }

    info!(sent, received, ok = outcome.is_ok(), "Driving loop finished");
    outcome
}

fn spawn_send_pump(transport: Transport) -> (mpsc::UnboundedSender<Message>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let task = tokio::spawn(
        async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = transport.send(&message).await {
                    warn!(round = message.round, error = %e, "Dropping outgoing message");
                }
            }
        }
        .in_current_span(),
    );
    (tx, task)
}
