//! Error types for the relay.
//!
//! Failures are scoped to the smallest unit they affect:
//! - `ProxyError::Bind` is the only error fatal to the whole proxy
//! - `ProxyError::UpstreamUnreachable` ends a single relay
//! - `TransformError` affects a single chunk and is recovered by the relay

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::proxy::ProxyState;

/// Errors surfaced by the listener, relays and controller.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The outbound connection to the destination failed or timed out.
    #[error("upstream {destination} unreachable: {source}")]
    UpstreamUnreachable {
        destination: String,
        #[source]
        source: io::Error,
    },

    /// `start` was called on a controller that already left `NotStarted`.
    #[error("proxy already started (state: {0:?})")]
    AlreadyStarted(ProxyState),

    /// An operation was requested in a lifecycle state that does not allow it.
    #[error("invalid proxy state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: ProxyState,
        actual: ProxyState,
    },

    /// A bind or destination address could not be parsed.
    #[error("invalid address '{input}': {reason}")]
    InvalidAddress { input: String, reason: &'static str },
}

impl ProxyError {
    pub(crate) fn invalid_address(input: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason,
        }
    }
}

/// A transform hook failed on a single chunk.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The hook refused to transform the chunk.
    #[error("transform rejected chunk: {0}")]
    Rejected(String),

    /// The transformed chunk exceeded the configured output limit.
    #[error("transformed chunk is {len} bytes, limit is {max}")]
    OutputTooLarge { len: usize, max: usize },

    /// The hook panicked.
    #[error("transform panicked: {0}")]
    Panicked(String),

    /// The runtime shut down before the hook finished.
    #[error("transform cancelled")]
    Cancelled,
}

/// Errors loading a transform pipeline file.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read pipeline file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse pipeline file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pipeline stage {index}: {reason}")]
    Invalid { index: usize, reason: String },
}
