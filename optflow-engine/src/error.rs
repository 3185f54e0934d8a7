//! Engine error taxonomy.
//!
//! Nothing here is fatal to the process: every failure degrades to a
//! user-visible status and, where relevant, a reconnect cycle.

use thiserror::Error;

/// All errors surfaced by the flow engine.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FlowError {
    /// Transport failed (refused connection, abrupt close). Drives a
    /// DISCONNECTED transition and a scheduled reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be decoded. The message is dropped; the
    /// connection stays up.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The feed reported an error inside an envelope. The connection stays
    /// up and retry timers keep running.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl FlowError {
    /// Whether this error closes the carrying connection.
    pub fn closes_connection(&self) -> bool {
        matches!(self, FlowError::Transport(_))
    }
}
