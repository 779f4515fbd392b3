//! Error types for the relay layer
//!
//! Every peer-level failure is expressed as a `RelayError`. Components absorb
//! these locally; only startup failures surface to `main` (as `anyhow` errors).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The peer does not speak the requested sub-protocol, or no stream could be opened.
    #[error("peer does not support {0}")]
    Unsupported(String),

    /// The liveness probe did not reach the peer.
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    /// The swarm task has stopped and no longer accepts commands.
    #[error("swarm task is not running")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, RelayError>;
