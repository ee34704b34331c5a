//! Chunk transform hooks.
//!
//! A hook sees every chunk read from either side of a relay before it is
//! written to the other side. Chunk boundaries are whatever a single read
//! returned; they carry no application-level meaning.
//!
//! Hooks may fail or block. They run on tokio's blocking pool, so a slow
//! hook never holds up a runtime worker or a relay shutdown. On error the
//! relay forwards the original chunk unchanged.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tokio::task;

use crate::error::TransformError;

mod fuzz;
mod pipeline;

pub use fuzz::{Fuzzer, Modifier};
pub use pipeline::{BytePattern, Pipeline, PipelineConfig, StageConfig, StageDirection};

/// Direction a chunk is travelling through a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to destination.
    Inbound,
    /// Destination to client.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// A function applied to each in-flight chunk. It may block.
pub trait TransformHook: Send + Sync + 'static {
    fn transform(&self, direction: Direction, chunk: &[u8]) -> Result<Vec<u8>, TransformError>;
}

impl<F> TransformHook for F
where
    F: Fn(Direction, &[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync + 'static,
{
    fn transform(&self, direction: Direction, chunk: &[u8]) -> Result<Vec<u8>, TransformError> {
        self(direction, chunk)
    }
}

/// Run a hook on the blocking pool.
///
/// The caller is never blocked by the hook itself: dropping the returned
/// future detaches a hook that is still running. A panic inside the hook
/// becomes `TransformError::Panicked`.
pub async fn apply(
    hook: Arc<dyn TransformHook>,
    direction: Direction,
    chunk: Vec<u8>,
) -> Result<Vec<u8>, TransformError> {
    match task::spawn_blocking(move || hook.transform(direction, &chunk)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TransformError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(TransformError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
