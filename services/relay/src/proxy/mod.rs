//! Single-destination TCP relay.
//!
//! This module provides:
//! - The listener and its accept loop
//! - Per-connection byte relays
//! - The registry of live relays
//! - The controller that owns start-up and ordered shutdown
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyListener -> ByteRelay --(TransformHook)--> Destination
//!                               |
//!                      ConnectionRegistry <- ProxyController::shutdown
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tcprelay::{ProxyController, ProxySettings};
//!
//! let controller = ProxyController::new(ProxySettings::default());
//! let addr = controller
//!     .start("127.0.0.1:9001".parse()?, "127.0.0.1:9002".parse()?)
//!     .await?;
//!
//! // ... later, from a signal handler
//! controller.shutdown().await;
//! ```

mod controller;
mod endpoint;
mod listener;
mod registry;
mod relay;

pub use controller::{ProxyController, ProxySettings, ProxyState};
pub use endpoint::{BindAddress, Destination};
pub use listener::{
    ListenerConfig, ListenerStats, ListenerStop, ProxyListener, DEFAULT_ACCEPT_INTERVAL,
};
pub use registry::ConnectionRegistry;
pub use relay::{
    ByteRelay, RelayHandle, RelayId, RelaySettings, RelayState, RelayTotals,
    DEFAULT_CONNECT_TIMEOUT,
};
