//! tcprelay
//!
//! Accepts TCP connections on a bind address and relays each one, byte for
//! byte, to a single fixed destination. An optional transform hook sees
//! every chunk in flight.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod transform;

pub use error::{PipelineError, ProxyError, TransformError};
pub use proxy::{
    BindAddress, ByteRelay, ConnectionRegistry, Destination, ListenerConfig, ListenerStats,
    ProxyController, ProxyListener, ProxySettings, ProxyState, RelayHandle, RelayId,
    RelaySettings, RelayState, RelayTotals,
};
pub use transform::{Direction, Pipeline, TransformHook};
