//! Per-connection byte relay.
//!
//! A relay owns one accepted inbound connection and the outbound connection
//! it opens to the destination. Once connected it runs two copy tasks, one
//! per direction. The first direction to see EOF or an I/O error ends the
//! whole relay; there is no half-duplex continuation.
//!
//! Stopping a relay aborts both copy tasks, which drops and thereby closes
//! both sockets. On termination, normal or forced, the relay removes itself
//! from the registry exactly once.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn, Instrument};

use super::endpoint::Destination;
use super::listener::ListenerStats;
use super::registry::ConnectionRegistry;
use crate::error::ProxyError;
use crate::transform::{self, Direction, TransformHook};

/// Default connect timeout for the outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Read buffer size per direction. A read may return anything from one byte
/// up to this size; that is the chunk handed to the transform hook.
const CHUNK_SIZE: usize = 64 * 1024;

static NEXT_RELAY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique relay identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayId(u64);

impl RelayId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_RELAY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay-{}", self.0)
    }
}

/// Lifecycle of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Opening the outbound connection.
    Connecting,
    /// Both connections open, bytes flowing.
    Relaying,
    /// Sockets closed and deregistered.
    Stopped,
}

/// Cloneable handle used to observe and stop a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    id: RelayId,
    peer_addr: Option<SocketAddr>,
    stop_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<RelayState>,
}

impl RelayHandle {
    /// Create a handle plus the receiving ends the relay itself keeps.
    pub(crate) fn channel(
        id: RelayId,
        peer_addr: Option<SocketAddr>,
    ) -> (Self, watch::Receiver<bool>, watch::Sender<RelayState>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(RelayState::Connecting);
        let handle = Self {
            id,
            peer_addr,
            stop_tx: Arc::new(stop_tx),
            state_rx,
        };
        (handle, stop_rx, state_tx)
    }

    pub fn id(&self) -> RelayId {
        self.id
    }

    /// Address of the client that opened the inbound connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> RelayState {
        *self.state_rx.borrow()
    }

    /// Request the relay to stop. Safe to call any number of times, from
    /// any task.
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            debug!(relay_id = %self.id, "Relay stop requested");
        }
    }

    /// Wait until the relay has closed its sockets and deregistered.
    pub async fn stopped(&self) {
        let mut state_rx = self.state_rx.clone();
        // A dropped sender means the relay is gone, which is also stopped.
        let _ = state_rx
            .wait_for(|state| *state == RelayState::Stopped)
            .await;
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-relay settings shared by every relay of a listener.
#[derive(Clone)]
pub struct RelaySettings {
    /// Where every accepted connection is forwarded.
    pub destination: Destination,
    /// Outbound connect timeout.
    pub connect_timeout: Duration,
    /// Optional transform applied to every chunk.
    pub hook: Option<Arc<dyn TransformHook>>,
}

impl RelaySettings {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            hook: None,
        }
    }
}

impl fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySettings")
            .field("destination", &self.destination)
            .field("connect_timeout", &self.connect_timeout)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Bytes read from each side over the life of one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    /// Read from the client, forwarded to the destination.
    pub bytes_to_upstream: u64,
    /// Read from the destination, forwarded to the client.
    pub bytes_from_upstream: u64,
}

/// Deregisters the relay and publishes `Stopped` when dropped.
struct Registration {
    id: RelayId,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ListenerStats>,
    state_tx: watch::Sender<RelayState>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.state_tx.send_replace(RelayState::Stopped);
    }
}

/// A relay between one accepted connection and the destination.
pub struct ByteRelay {
    id: RelayId,
    inbound: TcpStream,
    settings: RelaySettings,
    stop_rx: watch::Receiver<bool>,
    stats: Arc<ListenerStats>,
    registration: Registration,
}

impl ByteRelay {
    /// Create a relay for an accepted connection.
    ///
    /// The returned handle is what gets registered. Dropping the relay
    /// without running it still deregisters it and reports `Stopped`.
    pub fn new(
        inbound: TcpStream,
        peer_addr: SocketAddr,
        settings: RelaySettings,
        registry: Arc<ConnectionRegistry>,
        stats: Arc<ListenerStats>,
    ) -> (Self, RelayHandle) {
        let id = RelayId::next();
        let (handle, stop_rx, state_tx) = RelayHandle::channel(id, Some(peer_addr));
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let relay = Self {
            id,
            inbound,
            settings,
            stop_rx,
            stats: Arc::clone(&stats),
            registration: Registration {
                id,
                registry,
                stats,
                state_tx,
            },
        };
        (relay, handle)
    }

    pub fn id(&self) -> RelayId {
        self.id
    }

    /// Connect to the destination and relay until either side closes, an
    /// I/O error occurs, or a stop is requested.
    ///
    /// Fails with `UpstreamUnreachable` if the outbound connect fails; the
    /// inbound connection is closed in that case.
    pub async fn run(self) -> Result<RelayTotals, ProxyError> {
        let ByteRelay {
            id,
            inbound,
            settings,
            mut stop_rx,
            stats,
            registration,
        } = self;

        // Both sockets are owned by `serve` and closed by the time it returns,
        // before the registration is dropped.
        let result = serve(
            inbound,
            &settings,
            &mut stop_rx,
            &registration.state_tx,
            &stats,
        )
        .await;

        match &result {
            Ok(totals) => debug!(
                relay_id = %id,
                bytes_to_upstream = totals.bytes_to_upstream,
                bytes_from_upstream = totals.bytes_from_upstream,
                "Relay closed"
            ),
            Err(e) => warn!(relay_id = %id, error = %e, "Relay failed"),
        }

        drop(registration);
        result
    }
}

async fn serve(
    inbound: TcpStream,
    settings: &RelaySettings,
    stop_rx: &mut watch::Receiver<bool>,
    state_tx: &watch::Sender<RelayState>,
    stats: &Arc<ListenerStats>,
) -> Result<RelayTotals, ProxyError> {
    let outbound = tokio::select! {
        biased;
        _ = stop_requested(stop_rx) => {
            debug!("Stopped before upstream connected");
            return Ok(RelayTotals::default());
        }
        result = connect_upstream(&settings.destination, settings.connect_timeout) => match result {
            Ok(stream) => stream,
            Err(e) => {
                stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        },
    };

    stats.upstream_connected.fetch_add(1, Ordering::Relaxed);
    state_tx.send_replace(RelayState::Relaying);
    debug!(destination = %settings.destination, "Connected to upstream");

    let (inbound_read, inbound_write) = inbound.into_split();
    let (outbound_read, outbound_write) = outbound.into_split();

    let to_upstream = Arc::new(AtomicU64::new(0));
    let from_upstream = Arc::new(AtomicU64::new(0));

    let mut pumps = JoinSet::new();
    pumps.spawn(
        pump(
            inbound_read,
            outbound_write,
            Direction::Inbound,
            settings.hook.clone(),
            Arc::clone(&to_upstream),
            Arc::clone(stats),
        )
        .in_current_span(),
    );
    pumps.spawn(
        pump(
            outbound_read,
            inbound_write,
            Direction::Outbound,
            settings.hook.clone(),
            Arc::clone(&from_upstream),
            Arc::clone(stats),
        )
        .in_current_span(),
    );

    tokio::select! {
        Some(joined) = pumps.join_next() => match joined {
            Ok((direction, Ok(()))) => {
                debug!(direction = %direction, "Peer closed connection")
            }
            Ok((direction, Err(e))) => {
                debug!(direction = %direction, error = %e, "Relay I/O error")
            }
            Err(e) => warn!(error = %e, "Relay task failed"),
        },
        _ = stop_requested(stop_rx) => debug!("Relay stopped"),
    }

    // Aborts the surviving direction and waits for it, dropping every
    // socket half.
    pumps.shutdown().await;

    Ok(RelayTotals {
        bytes_to_upstream: to_upstream.load(Ordering::Relaxed),
        bytes_from_upstream: from_upstream.load(Ordering::Relaxed),
    })
}

async fn connect_upstream(
    destination: &Destination,
    connect_timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let unreachable = |source: io::Error| ProxyError::UpstreamUnreachable {
        destination: destination.to_string(),
        source,
    };

    match timeout(
        connect_timeout,
        TcpStream::connect((destination.host(), destination.port())),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(unreachable(e)),
        Err(_) => Err(unreachable(io::Error::new(
            io::ErrorKind::TimedOut,
            "connect timed out",
        ))),
    }
}

/// Resolves once a stop has been requested. Never resolves if every
/// handle is gone without requesting one.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    if stop_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Copy one direction until EOF or error.
async fn pump(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    direction: Direction,
    hook: Option<Arc<dyn TransformHook>>,
    moved: Arc<AtomicU64>,
    stats: Arc<ListenerStats>,
) -> (Direction, io::Result<()>) {
    let result = copy_chunks(reader, writer, direction, hook, &moved, &stats).await;
    (direction, result)
}

async fn copy_chunks(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    direction: Direction,
    hook: Option<Arc<dyn TransformHook>>,
    moved: &AtomicU64,
    stats: &ListenerStats,
) -> io::Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = &buf[..n];

        match &hook {
            Some(hook) => {
                match transform::apply(Arc::clone(hook), direction, chunk.to_vec()).await {
                    Ok(transformed) => writer.write_all(&transformed).await?,
                    Err(e) => {
                        stats.transform_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            direction = %direction,
                            error = %e,
                            "Transform failed, forwarding original chunk"
                        );
                        writer.write_all(chunk).await?;
                    }
                }
            }
            None => writer.write_all(chunk).await?,
        }

        moved.fetch_add(n as u64, Ordering::Relaxed);
        stats.record_bytes(direction, n as u64);
    }
}
