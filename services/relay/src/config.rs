//! Relay configuration.
//!
//! Every option can be given on the command line or through the
//! environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ProxyError;
use crate::logging::LogFormat;
use crate::proxy::{BindAddress, Destination, ProxySettings};

/// Accept interval bounds, in milliseconds.
const MIN_ACCEPT_INTERVAL_MS: u64 = 50;
const MAX_ACCEPT_INTERVAL_MS: u64 = 1000;

/// Relay configuration (CLI flags with env fallbacks).
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tcprelay",
    version,
    about = "Relay TCP connections from a bind address to a single destination"
)]
pub struct Config {
    /// Host name on which to bind.
    #[arg(long, env = "RELAY_BIND_HOST", default_value = "127.0.0.1")]
    pub bind_host: String,

    /// Port on which to bind (0 picks an ephemeral port).
    #[arg(long, env = "RELAY_BIND_PORT", default_value_t = 8080)]
    pub bind_port: u16,

    /// Host name to which data is sent.
    #[arg(long, env = "RELAY_DEST_HOST", default_value = "127.0.0.1")]
    pub dest_host: String,

    /// Port to which data is sent.
    #[arg(
        long,
        env = "RELAY_DEST_PORT",
        default_value_t = 8080,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub dest_port: u16,

    /// Transform pipeline file (TOML) applied to every chunk.
    #[arg(long = "transform", env = "RELAY_TRANSFORM")]
    pub transform: Option<PathBuf>,

    /// Upper bound on one accept wait, in milliseconds.
    #[arg(long, env = "RELAY_ACCEPT_INTERVAL_MS", default_value_t = 200)]
    pub accept_interval_ms: u64,

    /// Outbound connect timeout, in milliseconds.
    #[arg(long, env = "RELAY_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error). RUST_LOG wins if set.
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log line format.
    #[arg(long, env = "RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn bind_address(&self) -> Result<BindAddress, ProxyError> {
        BindAddress::new(self.bind_host.clone(), self.bind_port)
    }

    pub fn destination(&self) -> Result<Destination, ProxyError> {
        Destination::new(self.dest_host.clone(), self.dest_port)
    }

    pub fn accept_interval(&self) -> Duration {
        Duration::from_millis(
            self.accept_interval_ms
                .clamp(MIN_ACCEPT_INTERVAL_MS, MAX_ACCEPT_INTERVAL_MS),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Controller settings, without a transform hook.
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            accept_interval: self.accept_interval(),
            connect_timeout: self.connect_timeout(),
            hook: None,
        }
    }
}
