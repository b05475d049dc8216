//! Error taxonomy shared across the Shell and Chain Adapters.
//!
//! Error *kinds* here map onto the propagation policy in the design doc, not
//! onto any one external crate's error type: transport-layer failures always
//! arrive as [`IndexerError::Transport`] regardless of whether the underlying
//! cause was an `alloy` transport error, a Solana pubsub error, or a
//! `bitcoincore-rpc` error.

use thiserror::Error;

/// Fatal at process start: missing or malformed chain configuration.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Errors surfaced by a single Chain Adapter or the Shell around it.
///
/// Everything except [`IndexerError::Config`] is recoverable: adapters absorb
/// it, log it, and keep running per the propagation policy.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Missing or malformed configuration. Fatal at start.
    #[error("configuration error: {0}")]
    Config(String),

    /// RPC/WebSocket unreachable or dropped. The adapter reconnects with
    /// bounded backoff; this never tears down the Shell.
    #[error("transport error: {0}")]
    Transport(String),

    /// A specific block/tx/log failed to parse. Logged at warn; processing
    /// continues with the next item.
    #[error("decode error: {0}")]
    Decode(String),

    /// Malformed address or unsupported tokenId on add. Logged at warn; the
    /// add is dropped.
    #[error("validation error: {0}")]
    Validation(String),

    /// The singleton lease is already held by another instance.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Work-queue enqueue failed. Logged at error; not retried inside the core.
    #[error("queue error: {0}")]
    Queue(String),
}

impl From<ConfigError> for IndexerError {
    fn from(value: ConfigError) -> Self {
        IndexerError::Config(value.0)
    }
}

impl From<redis::RedisError> for IndexerError {
    fn from(value: redis::RedisError) -> Self {
        IndexerError::Transport(value.to_string())
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(value: serde_json::Error) -> Self {
        IndexerError::Decode(value.to_string())
    }
}
