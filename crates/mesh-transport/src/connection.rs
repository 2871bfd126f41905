//! Connection manager
//!
//! Each remote party gets at most one outbound connection, dialed with a fixed
//! backoff until it succeeds or the party leaves the run. A single listener
//! accepts the connections remote parties dial to us; those are only read
//! from and are never redialed from this side.

use crate::transport::Transport;
use futures_util::{SinkExt, StreamExt};
use mpc_mesh_core::{Error, PartyId, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

type FrameSink = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Outbound connection to one remote party
#[derive(Clone)]
pub(crate) struct Connection {
    /// Distinguishes this connection from earlier ones to the same party
    pub(crate) epoch: u64,
    writer: Arc<Mutex<FrameSink>>,
    /// Stops the reader watching the other half of the socket
    closer: CancellationToken,
}

impl Connection {
    /// Stop the reader; the socket closes once the last writer handle drops
    pub(crate) fn close(self) {
        self.closer.cancel();
    }
}

impl Transport {
    /// Bind `addr` and start accepting connections from remote dialers
    ///
    /// Returns the bound address. Failing to bind is fatal for the run.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        self.serve(listener)
    }

    /// Start accepting connections on an already bound listener
    pub fn serve(&self, listener: TcpListener) -> Result<SocketAddr> {
        let local = listener.local_addr()?;
        info!(party = %self.local_id(), address = %local, "Listening");
        tokio::spawn(self.clone().accept_loop(listener));
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    debug!(remote = %remote, "Accepted connection");
                    let _ = stream.set_nodelay(true);
                    // The whole stream is kept so our write side stays open
                    tokio::spawn(self.clone().read_frames(
                        stream,
                        Some(remote),
                        None,
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
        debug!(party = %self.local_id(), "Listener stopped");
    }

    /// Dial `id` in the background unless it is connected or being dialed
    pub fn connect(&self, id: &PartyId) -> Result<()> {
        self.spawn_dial(id)
    }

    /// Dial every remote party in the peer table
    pub fn connect_all(&self) {
        let remotes: Vec<PartyId> = self.lock().peers.remote_ids().cloned().collect();
        for id in remotes {
            if let Err(e) = self.spawn_dial(&id) {
                warn!(party = %id, error = %e, "Not dialing party");
            }
        }
    }

    pub(crate) fn spawn_dial(&self, id: &PartyId) -> Result<()> {
        let (addr, cancel) = {
            let mut state = self.lock();
            let addr = state
                .peers
                .address(id)
                .ok_or_else(|| Error::UnknownParty(id.clone()))?
                .to_string();
            if state.finished.contains(id)
                || state.connections.contains_key(id)
                || state.dialing.contains(id)
            {
                return Ok(());
            }
            let cancel = match state.cancels.get(id) {
                Some(cancel) if !cancel.is_cancelled() => cancel.clone(),
                _ => return Ok(()),
            };
            state.dialing.insert(id.clone());
            (addr, cancel)
        };

        tokio::spawn(self.clone().dial(id.clone(), addr, cancel));
        Ok(())
    }

    #[instrument(skip(self, id, cancel), fields(party = %id))]
    async fn dial(self, id: PartyId, addr: String, cancel: CancellationToken) {
        let backoff = self.shared.config.retry_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = TcpStream::connect(addr.as_str()) => result,
            };

            match result {
                Ok(stream) => {
                    self.attach(&id, stream, &cancel);
                    return;
                }
                Err(source) => {
                    self.shared.stats.dial_failures.inc();
                    let err = Error::Connect {
                        party: id.clone(),
                        addr: addr.clone(),
                        source,
                    };
                    warn!(attempt, error = %err, retry_in = ?backoff, "Dial failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.lock().dialing.remove(&id);
        debug!("Dial cancelled");
    }

    /// Store a freshly dialed stream unless the party no longer needs one
    fn attach(&self, id: &PartyId, stream: TcpStream, party_cancel: &CancellationToken) {
        let _ = stream.set_nodelay(true);
        let remote = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let closer = party_cancel.child_token();
        let mut connection = Connection {
            epoch: 0,
            writer: Arc::new(Mutex::new(FramedWrite::new(writer, LinesCodec::new()))),
            closer: closer.clone(),
        };

        let epoch = {
            let mut state = self.lock();
            state.dialing.remove(id);
            let wanted = state.peers.is_remote(id)
                && !state.finished.contains(id)
                && !party_cancel.is_cancelled();
            if !wanted || state.connections.contains_key(id) {
                None
            } else {
                let epoch = state.next_epoch();
                connection.epoch = epoch;
                state.connections.insert(id.clone(), connection.clone());
                Some(epoch)
            }
        };

        let Some(epoch) = epoch else {
            debug!(party = %id, "Abandoning redundant connection");
            connection.close();
            return;
        };

        self.shared.stats.connections_established.inc();
        self.notify_change();
        info!(party = %id, remote = ?remote, epoch, "Connected");

        tokio::spawn(self.clone().read_frames(
            reader,
            remote,
            Some((id.clone(), epoch)),
            closer,
        ));
    }

    /// Drop the connection to `id` if it is still `epoch`, then redial
    pub(crate) fn disconnect(&self, id: &PartyId, epoch: u64, reason: &str) {
        let removed = {
            let mut state = self.lock();
            match state.connections.get(id) {
                Some(conn) if conn.epoch == epoch => state.connections.remove(id),
                _ => None,
            }
        };

        let Some(connection) = removed else {
            return;
        };
        connection.close();
        self.notify_change();
        warn!(party = %id, epoch, reason, "Connection lost");

        if let Err(e) = self.spawn_dial(id) {
            debug!(party = %id, error = %e, "Not redialing");
        }
    }

    /// Write one frame; a failure drops the connection
    pub(crate) async fn write_frame(&self, id: &PartyId, conn: &Connection, line: &str) -> bool {
        let result = {
            let mut sink = conn.writer.lock().await;
            sink.send(line).await
        };

        match result {
            Ok(()) => {
                self.shared.stats.frames_sent.inc();
                trace!(to = %id, "Frame written");
                true
            }
            Err(e) => {
                self.shared.stats.write_failures.inc();
                warn!(to = %id, error = %e, "Write failed");
                self.disconnect(id, conn.epoch, "write failed");
                false
            }
        }
    }

    /// Feed every frame of a connection to the router until it ends
    ///
    /// Frames are split on raw newlines, so a frame that is not UTF-8 or does
    /// not parse is dropped and reading continues. The connection ends on
    /// EOF, on a read error, or on an oversized frame.
    async fn read_frames<R>(
        self,
        reader: R,
        remote: Option<SocketAddr>,
        link: Option<(PartyId, u64)>,
        cancel: CancellationToken,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let codec = AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            Vec::new(),
            self.shared.config.max_frame_len,
        );
        let mut frames = FramedRead::new(reader, codec);

        let reason = loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break None,
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => self.route_frame(&frame),
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    self.shared.stats.frames_malformed.inc();
                    break Some("frame exceeds length limit".to_string());
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => break Some(format!("read error: {}", e)),
                None => break Some("closed by peer".to_string()),
            }
        };

        if let Some(reason) = reason {
            debug!(remote = ?remote, reason = %reason, "Connection reader stopped");
            if let Some((id, epoch)) = link {
                self.disconnect(&id, epoch, &reason);
            }
        }
    }

    fn route_frame(&self, frame: &[u8]) {
        let frame = frame.strip_suffix(b"\r").unwrap_or(frame);
        if frame.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        self.shared.stats.frames_received.inc();

        let decoded = std::str::from_utf8(frame)
            .map_err(|e| Error::Frame(format!("frame is not UTF-8: {}", e)))
            .and_then(|line| self.shared.config.framing.decode(line));
        match decoded {
            Ok(message) => {
                trace!(message = %message, "Frame received");
                self.deliver(message);
            }
            Err(e) => {
                self.shared.stats.frames_malformed.inc();
                warn!(error = %e, "Dropping malformed frame");
            }
        }
    }
}
