// Connection registry entries and the per-connection single-writer task.
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::api::ConnectionDescription;
use crate::services::ServiceKey;

/// Stable identifier of a live connection, allocated on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cheap clonable sending side of a connection. All socket writes go through
/// the writer task; the handle only enqueues complete frames.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
    close: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Bytes>, close: CancellationToken) -> Self {
        Self {
            id,
            outbound,
            close,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a frame the protocol cannot afford to lose (request and reply
    /// forwarding). A full queue means the peer stopped draining: close it.
    pub fn send_forward(&self, frame: Bytes) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = %self.id, "outbound queue full on rpc traffic, closing connection");
                self.close.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Enqueue a best-effort frame (publications, spy copies). Dropped with a
    /// warning when the peer is slow; publishers are never stalled.
    pub fn send_publish(&self, frame: Bytes) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("cellaserv_publish_dropped_total").increment(1);
                tracing::warn!(conn = %self.id, "outbound queue full, dropping publication");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn close(&self) {
        self.close.cancel();
    }
}

pub(crate) struct ConnectionEntry {
    pub handle: ConnectionHandle,
    pub peer_addr: SocketAddr,
    /// Optional human-readable name assigned through the meta-service.
    pub name: Option<String>,
    /// Services registered by this connection.
    pub services: HashSet<ServiceKey>,
    /// Services this connection spies on.
    pub spying: HashSet<ServiceKey>,
}

impl ConnectionEntry {
    pub fn new(handle: ConnectionHandle, peer_addr: SocketAddr) -> Self {
        Self {
            handle,
            peer_addr,
            name: None,
            services: HashSet::new(),
            spying: HashSet::new(),
        }
    }

    /// Human-readable identity: the assigned name, or the peer address.
    pub fn describe(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.peer_addr.to_string())
    }

    pub fn description(&self, id: ConnectionId) -> ConnectionDescription {
        ConnectionDescription {
            id: id.0,
            addr: self.peer_addr.to_string(),
            name: self.name.clone(),
        }
    }
}

/// Writer loop: sole owner of the socket's write half, so frames are never
/// interleaved. A write error or timeout marks the connection dead.
pub(crate) async fn run_writer<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    close: CancellationToken,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match timeout(write_timeout, writer.write_all(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(error = %err, "connection write failed");
                        close.cancel();
                        break;
                    }
                    Err(_) => {
                        tracing::warn!("connection write timed out");
                        close.cancel();
                        break;
                    }
                }
            }
        }
    }
    // Flush frames enqueued before the close, bounded by one write timeout.
    let deadline = Instant::now() + write_timeout;
    while let Ok(frame) = outbound.try_recv() {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        match timeout(remaining, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
    let _ = writer.shutdown().await;
}
