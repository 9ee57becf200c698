//! Error types for the streaming client.
//!
//! Only [`RpcError::Config`] is fatal to the process. Source errors are
//! recovered by the producer, persistence errors are logged per item, and
//! transport errors and timeouts end the current run but are reported rather
//! than propagated.

use thiserror::Error;

/// Unified error type for the streaming client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Missing or invalid configuration, detected before any pipeline work.
    #[error("configuration error: {0}")]
    Config(String),

    /// The record source is absent or unreadable.
    #[error("record source error: {0}")]
    Source(String),

    /// The duplex stream failed or was closed by the remote.
    #[error("transport error: {0}")]
    Transport(String),

    /// Writing a reply payload failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An internal channel was closed while still in use.
    #[error("channel error: {0}")]
    ChannelClosed(String),

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        Self::Transport(format!("{:?}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
