// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! A pure in-process stand-in for the broker. It is used by the test suite
//! (where a scripted task plays the external processor) and for local runs
//! without Kafka.
//!
//! ## Reference Semantics
//!
//! - Once `subscribe()` returns successfully, messages published *after* that
//!   point on the same topic are deliverable.
//! - Every subscriber of a topic receives every message (fan-out), like
//!   consumers in distinct consumer groups.
//! - Publishing to a topic with no subscribers succeeds and drops the
//!   message, as a broker with no consumers would retain it unseen.
//! - A closed transport rejects `publish()` and `subscribe()`.
//!
//! ## Non-Goals
//!
//! Persistence, partitioning, consumer-group balancing and broker failure
//! simulation beyond the closed state.

mod transport;

pub use transport::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};
