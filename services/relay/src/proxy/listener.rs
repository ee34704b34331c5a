//! TCP listener and accept loop.
//!
//! The accept loop waits for a connection with a bounded timeout rather than
//! blocking indefinitely, so a stop request is observed within one accept
//! interval. Every accepted connection becomes a [`ByteRelay`] that is
//! registered and then spawned as its own task.
//!
//! Accept errors are logged and the loop keeps going; a single bad accept
//! never takes the listener down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use super::endpoint::BindAddress;
use super::registry::ConnectionRegistry;
use super::relay::{ByteRelay, RelaySettings};
use crate::error::ProxyError;
use crate::transform::Direction;

/// Default bound on a single accept wait.
pub const DEFAULT_ACCEPT_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind: BindAddress,
    /// Upper bound on one accept wait; also the stop-request latency.
    pub accept_interval: Duration,
    /// Settings handed to every relay.
    pub relay: RelaySettings,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind: BindAddress, relay: RelaySettings) -> Self {
        Self {
            bind,
            accept_interval: DEFAULT_ACCEPT_INTERVAL,
            relay,
        }
    }
}

/// Statistics for a listener and its relays.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Relays currently alive.
    pub connections_active: AtomicU64,
    /// Relays terminated.
    pub connections_closed: AtomicU64,
    /// Accept calls that failed.
    pub accept_errors: AtomicU64,
    /// Outbound connections established.
    pub upstream_connected: AtomicU64,
    /// Outbound connections that failed or timed out.
    pub upstream_failed: AtomicU64,
    /// Chunks forwarded untransformed because the hook failed.
    pub transform_failures: AtomicU64,
    /// Bytes read from clients.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes read from the destination.
    pub bytes_from_upstream: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn record_bytes(&self, direction: Direction, n: u64) {
        let counter = match direction {
            Direction::Inbound => &self.bytes_to_upstream,
            Direction::Outbound => &self.bytes_from_upstream,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Stop flag shared between a listener and whoever shuts it down.
#[derive(Debug, Clone, Default)]
pub struct ListenerStop(Arc<AtomicBool>);

impl ListenerStop {
    /// Request the accept loop to exit. Returns true on the first call.
    pub fn stop(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The proxy's listening socket and accept loop.
pub struct ProxyListener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Resolved local address.
    local_addr: SocketAddr,
    /// Live relays.
    registry: Arc<ConnectionRegistry>,
    /// Statistics.
    stats: Arc<ListenerStats>,
    /// Stop flag checked at every accept timeout.
    stop: ListenerStop,
}

impl ProxyListener {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        registry: Arc<ConnectionRegistry>,
        stats: Arc<ListenerStats>,
    ) -> Result<Self, ProxyError> {
        let bind_error = |source: std::io::Error| ProxyError::Bind {
            address: config.bind.to_string(),
            source,
        };

        let listener = TcpListener::bind((config.bind.host(), config.bind.port()))
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(
            bind_addr = %local_addr,
            destination = %config.relay.destination,
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            registry,
            stats,
            stop: ListenerStop::default(),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops this listener once it is running.
    pub fn stop_handle(&self) -> ListenerStop {
        self.stop.clone()
    }

    /// Run the accept loop until stopped. The listening socket is closed
    /// when this returns.
    pub async fn run(self) {
        info!(bind_addr = %self.local_addr, "Listener started");

        while !self.stop.is_stopped() {
            match timeout(self.config.accept_interval, self.listener.accept()).await {
                // No connection within the interval; re-check the stop flag.
                Err(_) => continue,
                Ok(Ok((stream, peer_addr))) => {
                    if self.stop.is_stopped() {
                        debug!(
                            peer_addr = %peer_addr,
                            "Dropping connection accepted during shutdown"
                        );
                        break;
                    }
                    self.spawn_relay(stream, peer_addr);
                }
                Ok(Err(e)) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(self.config.accept_interval).await;
                }
            }
        }

        info!(bind_addr = %self.local_addr, "Listener stopped");
    }

    fn spawn_relay(&self, stream: TcpStream, peer_addr: SocketAddr) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        let (relay, handle) = ByteRelay::new(
            stream,
            peer_addr,
            self.config.relay.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
        );
        let relay_id = relay.id();
        self.registry.add(handle);
        debug!(relay_id = %relay_id, peer_addr = %peer_addr, "Connection accepted");

        // Errors are logged by the relay itself.
        tokio::spawn(
            async move {
                let _ = relay.run().await;
            }
            .instrument(tracing::info_span!("relay", relay_id = %relay_id, peer = %peer_addr)),
        );
    }
}
