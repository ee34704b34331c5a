//! Proxy lifecycle.
//!
//! ```text
//! NotStarted --start--> Running --shutdown--> Stopping --drained--> Stopped
//! ```
//!
//! Transitions are monotonic; a stopped controller cannot be restarted.
//! Shutdown order is fixed: stop the listener (no new relays), then stop
//! and join every registered relay, then report `Stopped`. The registry
//! therefore only shrinks once shutdown begins.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use super::endpoint::{BindAddress, Destination};
use super::listener::{
    ListenerConfig, ListenerStats, ListenerStop, ProxyListener, DEFAULT_ACCEPT_INTERVAL,
};
use super::registry::ConnectionRegistry;
use super::relay::{RelaySettings, DEFAULT_CONNECT_TIMEOUT};
use crate::error::ProxyError;
use crate::transform::TransformHook;

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Settings applied when the controller starts.
#[derive(Clone)]
pub struct ProxySettings {
    /// Upper bound on one accept wait.
    pub accept_interval: Duration,
    /// Outbound connect timeout per relay.
    pub connect_timeout: Duration,
    /// Optional transform applied to every chunk in both directions.
    pub hook: Option<Arc<dyn TransformHook>>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            accept_interval: DEFAULT_ACCEPT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            hook: None,
        }
    }
}

impl ProxySettings {
    pub fn with_hook(mut self, hook: Arc<dyn TransformHook>) -> Self {
        self.hook = Some(hook);
        self
    }
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("accept_interval", &self.accept_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

struct RunningListener {
    stop: ListenerStop,
    task: JoinHandle<()>,
}

/// Owns one listener and its relays for the lifetime of the proxy.
pub struct ProxyController {
    settings: ProxySettings,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ListenerStats>,
    state: watch::Sender<ProxyState>,
    /// Serializes `start` and `shutdown`.
    listener: Mutex<Option<RunningListener>>,
    local_addr: OnceLock<SocketAddr>,
}

impl ProxyController {
    pub fn new(settings: ProxySettings) -> Self {
        let (state, _) = watch::channel(ProxyState::NotStarted);
        Self {
            settings,
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(ListenerStats::default()),
            state,
            listener: Mutex::new(None),
            local_addr: OnceLock::new(),
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.state.borrow()
    }

    /// Live relays.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    /// Address the listener is bound to. Only available while running.
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        let state = self.state();
        match (state, self.local_addr.get()) {
            (ProxyState::Running, Some(addr)) => Ok(*addr),
            _ => Err(ProxyError::InvalidState {
                expected: ProxyState::Running,
                actual: state,
            }),
        }
    }

    /// Bind `bind` and start relaying every accepted connection to
    /// `destination`. Returns the bound address.
    ///
    /// Fails with `AlreadyStarted` unless the controller is `NotStarted`,
    /// and with `Bind` if the listening socket cannot be bound; a failed
    /// bind leaves the controller `NotStarted`.
    pub async fn start(
        &self,
        bind: BindAddress,
        destination: Destination,
    ) -> Result<SocketAddr, ProxyError> {
        let mut listener_slot = self.listener.lock().await;

        let state = self.state();
        if state != ProxyState::NotStarted {
            return Err(ProxyError::AlreadyStarted(state));
        }

        let relay = RelaySettings {
            destination,
            connect_timeout: self.settings.connect_timeout,
            hook: self.settings.hook.clone(),
        };
        let mut config = ListenerConfig::new(bind, relay);
        config.accept_interval = self.settings.accept_interval;

        let listener =
            ProxyListener::bind(config, Arc::clone(&self.registry), Arc::clone(&self.stats))
                .await?;
        let local_addr = listener.local_addr();
        let stop = listener.stop_handle();
        let task = tokio::spawn(
            listener
                .run()
                .instrument(tracing::info_span!("listener", bind_addr = %local_addr)),
        );

        *listener_slot = Some(RunningListener { stop, task });
        let _ = self.local_addr.set(local_addr);
        self.state.send_replace(ProxyState::Running);

        info!(bind_addr = %local_addr, "Proxy running");
        Ok(local_addr)
    }

    /// Stop accepting, stop and join every relay, then report `Stopped`.
    ///
    /// A no-op when `NotStarted` or `Stopped`. Concurrent callers wait for
    /// the first shutdown to finish.
    pub async fn shutdown(&self) {
        let mut listener_slot = self.listener.lock().await;

        match self.state() {
            ProxyState::NotStarted | ProxyState::Stopped => return,
            ProxyState::Running | ProxyState::Stopping => {}
        }
        self.state.send_replace(ProxyState::Stopping);
        info!(active_relays = self.registry.len(), "Shutting down proxy");

        if let Some(listener) = listener_slot.take() {
            listener.stop.stop();
            if let Err(e) = listener.task.await {
                warn!(error = %e, "Listener task failed");
            }
        }

        let drained = self.registry.stop_all().await;

        self.state.send_replace(ProxyState::Stopped);
        info!(drained, "Proxy stopped");
    }

    /// Wait until the proxy is no longer running. Returns immediately if it
    /// was never started.
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state.subscribe();
        let _ = state_rx
            .wait_for(|state| matches!(state, ProxyState::NotStarted | ProxyState::Stopped))
            .await;
    }
}

impl Drop for ProxyController {
    fn drop(&mut self) {
        // Best effort when dropped without shutdown: nothing can be awaited here.
        if let Some(listener) = self.listener.get_mut().take() {
            listener.stop.stop();
        }
        for relay in self.registry.snapshot() {
            relay.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> ProxySettings {
        ProxySettings {
            accept_interval: Duration::from_millis(50),
            ..ProxySettings::default()
        }
    }

    fn unused_destination() -> Destination {
        Destination::new("127.0.0.1", 9).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let controller = ProxyController::new(fast_settings());
        assert_eq!(controller.state(), ProxyState::NotStarted);
        assert!(controller.local_addr().is_err());

        let addr = controller
            .start("127.0.0.1:0".parse().unwrap(), unused_destination())
            .await
            .unwrap();
        assert_eq!(controller.state(), ProxyState::Running);
        assert_eq!(controller.local_addr().unwrap(), addr);

        controller.shutdown().await;
        assert_eq!(controller.state(), ProxyState::Stopped);
        assert!(matches!(
            controller.local_addr(),
            Err(ProxyError::InvalidState {
                actual: ProxyState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let controller = ProxyController::new(fast_settings());
        controller
            .start("127.0.0.1:0".parse().unwrap(), unused_destination())
            .await
            .unwrap();

        let err = controller
            .start("127.0.0.1:0".parse().unwrap(), unused_destination())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyStarted(ProxyState::Running)));

        controller.shutdown().await;
        let err = controller
            .start("127.0.0.1:0".parse().unwrap(), unused_destination())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyStarted(ProxyState::Stopped)));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let controller = ProxyController::new(fast_settings());
        controller.shutdown().await;
        assert_eq!(controller.state(), ProxyState::NotStarted);
        controller.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_failed_bind_stays_not_started() {
        let first = ProxyController::new(fast_settings());
        let addr = first
            .start("127.0.0.1:0".parse().unwrap(), unused_destination())
            .await
            .unwrap();

        let second = ProxyController::new(fast_settings());
        let err = second
            .start(
                BindAddress::new("127.0.0.1", addr.port()).unwrap(),
                unused_destination(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert_eq!(second.state(), ProxyState::NotStarted);

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_shutdown() {
        let controller = Arc::new(ProxyController::new(fast_settings()));
        controller
            .start("127.0.0.1:0".parse().unwrap(), unused_destination())
            .await
            .unwrap();

        let a = Arc::clone(&controller);
        let b = Arc::clone(&controller);
        tokio::join!(a.shutdown(), b.shutdown(), controller.wait_stopped());
        assert_eq!(controller.state(), ProxyState::Stopped);
    }
}
