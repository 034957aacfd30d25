//! Error types for the going overlay

use crate::{message::StatusCode, network::PeerId};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for going operations
pub type Result<T> = std::result::Result<T, GoingError>;

/// Main error type for going operations
#[derive(Error, Debug)]
pub enum GoingError {
    /// Transport-level errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire framing errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The registry answered with a non-success status
    #[error("Registry returned {code:?}: {body}")]
    Registry { code: StatusCode, body: String },

    /// The registry has no entry for the requested peer
    #[error("Peer {0} not found")]
    PeerNotFound(PeerId),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network-specific error types
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to bind to socket
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// A request saw no correlated response before its deadline
    #[error("Request timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The outbound queue stayed full for the whole enqueue window
    #[error("Outbound queue full for {duration:?}")]
    QueueFull { duration: Duration },

    /// The endpoint has been closed
    #[error("Endpoint is closed")]
    Closed,
}

/// Wire framing error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload does not fit in the 16-bit size field
    #[error("Payload size {size} exceeds maximum {max_size}")]
    PayloadTooLarge { size: usize, max_size: usize },

    /// Fewer bytes than a full header
    #[error("Datagram of {len} bytes is shorter than the {header_len}-byte header")]
    Truncated { len: usize, header_len: usize },

    /// Declared payload length runs past the end of the datagram
    #[error("Declared payload size {declared} exceeds the {available} bytes available")]
    SizeMismatch { declared: usize, available: usize },
}

/// Serialization error types
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format
    #[error("Invalid message format: expected {expected}, got {actual}")]
    InvalidFormat { expected: String, actual: String },
}

impl GoingError {
    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        GoingError::Config(msg.into())
    }

    /// Whether this error is a request timeout, so callers can decide to retry
    pub fn is_timeout(&self) -> bool {
        matches!(self, GoingError::Network(NetworkError::Timeout { .. }))
    }
}

impl From<serde_json::Error> for GoingError {
    fn from(err: serde_json::Error) -> Self {
        GoingError::Serialization(SerializationError::Json(err))
    }
}
