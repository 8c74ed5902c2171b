// src/transport/kafka/mod.rs

//! Kafka transport implementation using `rdkafka`.
//!
//! ## Concurrency model
//!
//! - One `FutureProducer` is created with the transport and shared by every
//!   publish call, so all requests ride a single long-lived producer session.
//! - Every `subscribe()` creates its own `StreamConsumer` in the configured
//!   consumer group and spawns a task that drains it into the subscription
//!   inbox.
//! - `close()` signals the consumer tasks to stop and flushes the producer.
//!
//! ## Correlation metadata
//!
//! Outbound records carry the correlation token both as the record key and
//! as a header named by `header_key`. Inbound records are matched by that
//! header, falling back to the record key when the header is absent.

mod transport;

pub use transport::create_transport as create_kafka_transport;
