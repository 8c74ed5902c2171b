// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-facing interface used by the publish
//! workers and the subscribe loop. It intentionally avoids any reference to
//! concrete brokers or client libraries; implementations live under
//! `src/transport/`.
//!
//! The transport layer is responsible only for moving opaque envelopes
//! between topics. Correlation, deadlines and backpressure are handled by
//! the bridge on top of it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{CorrelationId, Result};

/// A broker topic.
///
/// Topics are immutable, cheap to clone, and safe to share across threads.
/// Their syntax is whatever the underlying broker accepts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Topic(pub Arc<str>);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Topic
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Topic(value.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to receive every message published to one topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub Topic);

impl From<Topic> for Subscription {
    fn from(topic: Topic) -> Self {
        Subscription(topic)
    }
}

impl From<&str> for Subscription {
    fn from(value: &str) -> Self {
        Subscription(Topic::from(value))
    }
}

/// An opaque message envelope.
///
/// Carries the payload bytes plus the correlation token that travels in the
/// message metadata. The transport never interprets the payload.
///
/// # Examples
///
/// ```
/// # use mom_bridge::{CorrelationId, Envelope, Topic};
/// # use bytes::Bytes;
/// let env = Envelope::request(
///     Topic::from("mpc.json.bifast.request"),
///     CorrelationId::generate(),
///     Bytes::from_static(b"PING"),
/// );
/// assert!(env.correlation_id.is_some());
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Topic the envelope was published to (or is destined for).
    pub topic: Topic,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation token from the message metadata.
    ///
    /// Always `Some` for requests minted by the bridge. Inbound messages
    /// published by foreign producers may lack it.
    pub correlation_id: Option<CorrelationId>,
}

impl Envelope {
    // ---

    /// Create an outbound request envelope.
    pub fn request(topic: Topic, correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            topic,
            payload,
            correlation_id: Some(correlation_id),
        }
    }

    /// Create a response envelope, as the external processor would publish it.
    pub fn response(topic: Topic, correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            topic,
            payload,
            correlation_id: Some(correlation_id),
        }
    }
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until either the handle is dropped or
/// the transport is closed; in both cases `inbox.recv()` eventually yields
/// `None`.
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for envelopes delivered on the subscribed topic.
    pub inbox: mpsc::Receiver<Envelope>,
}

/// Broker transport abstraction.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after*
///   that point on the subscribed topic are deliverable.
/// - `publish()` resolves only after the broker accepted the message (or
///   failed to), so callers can bound it with a timeout.
/// - One transport instance owns one long-lived producer session; callers
///   share it through [`TransportPtr`] instead of reconnecting per message.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---

    /// Identifier of this transport instance, used for logging.
    fn transport_id(&self) -> &str;

    /// Publish an envelope to `env.topic`.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Register a subscription and return a handle for receiving messages.
    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only bumps a reference count; all clones share the same
/// broker session.
pub type TransportPtr = Arc<dyn Transport>;
