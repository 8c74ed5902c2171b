use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur while bridging requests onto the broker.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Listener could not bind its configured address (fatal at startup).
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket read or write failure on a client connection.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Client sent a frame larger than the configured maximum.
    #[error("frame exceeds maximum length of {max} bytes")]
    FrameTooLarge { max: usize },

    /// The request could not be handed to the broker.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Reading from the response topic failed.
    #[error("consume failed: {0}")]
    Consume(String),

    /// No response carrying the request's correlation id arrived in time.
    #[error("no response received before deadline")]
    CorrelationTimeout,

    /// Another handler already waits on this correlation id.
    #[error("correlation id already claimed: {0}")]
    AlreadyClaimed(String),

    /// Transport-level failure (broker client, channel closed, etc.).
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
