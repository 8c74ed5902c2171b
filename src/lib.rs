//! Synchronous TCP request/response over a publish/subscribe broker.
//!
//! A client opens a TCP connection, sends a request frame and blocks until
//! the correlated response arrives from the broker (or a deadline expires).
//! The bridge mints a correlation token per request, publishes the request
//! tagged with it, and matches responses back to the waiting connection.
//!
//! The broker sits behind the [`Transport`] trait. The in-memory transport is
//! always available; the Kafka transport is enabled with the
//! `transport_rdkafka` feature.

// Import all sub modules once...
mod macros;

mod bridge;
mod domain;
mod publisher;
mod server;
mod store;
mod subscriber;
mod transport;

mod bridge_config;
mod correlation;
mod error;
mod retry;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use bridge::Bridge;
pub use server::{BridgeServer, FrameCodec, HandlerContext};

pub use bridge_config::{BridgeConfig, FrameMode};
pub use retry::{Backoff, RetryConfig};

pub use correlation::CorrelationId;
pub use error::{BridgeError, Result};

pub use publisher::Publisher;
pub use store::{Claim, CorrelationStore, StoreStats};

pub use transport::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_rdkafka")]
pub use transport::create_kafka_transport;

// --- public re-exports
pub use domain::{
    //
    Envelope,
    Subscription,
    SubscriptionHandle,
    Topic,
    Transport,
    TransportPtr,
};

/// Build the transport selected by `config.transport_type`.
///
/// `None` picks Kafka when the crate is built with `transport_rdkafka` and
/// the in-memory transport otherwise.
///
/// # Errors
///
/// Returns [`BridgeError::InvalidConfig`] for an unknown transport type (or
/// `kafka` without the feature), and whatever the transport factory returns.
pub async fn create_transport(config: &BridgeConfig) -> Result<TransportPtr> {
    // ---
    let default_type = if cfg!(feature = "transport_rdkafka") {
        "kafka"
    } else {
        "memory"
    };

    match config.transport_type.as_deref().unwrap_or(default_type) {
        "memory" => create_memory_transport(&config.transport_id).await,

        #[cfg(feature = "transport_rdkafka")]
        "kafka" => create_kafka_transport(config).await,

        #[cfg(not(feature = "transport_rdkafka"))]
        "kafka" => Err(BridgeError::InvalidConfig(
            "kafka transport requires the `transport_rdkafka` feature".to_string(),
        )),

        other => Err(BridgeError::InvalidConfig(format!(
            "unknown transport type `{other}`"
        ))),
    }
}
