//! Transport implementations.
//!
//! Concrete implementations of the domain-level `Transport` trait. Broker
//! clients sit behind feature flags and are exposed only through
//! constructor functions.
//!
//! Bridge code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_rdkafka")]
mod kafka;

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_rdkafka")]
pub use kafka::create_kafka_transport;
