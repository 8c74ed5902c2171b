//! Bridge configuration.
//!
//! Everything the bridge needs at startup: broker coordinates, topic names,
//! the client-facing listen address, deadlines and pool sizes. Nothing here
//! is hardcoded in the runtime; the binary fills it from CLI flags and
//! environment variables, tests build it with the `with_*` methods.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

use crate::{BridgeError, Result, RetryConfig};

/// How request and response frames are delimited on the client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Newline-terminated frames in both directions.
    #[default]
    Line,

    /// 4-byte big-endian length prefix in both directions; payloads may
    /// contain any byte.
    LengthPrefixed,

    /// Legacy mode: fixed `max_frame_len` request buffers (a shorter read is
    /// one request), NUL padding trimmed; responses are newline-terminated.
    Padded,
}

impl FromStr for FrameMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(Self::Line),
            "length-prefixed" | "length" => Ok(Self::LengthPrefixed),
            "padded" | "legacy" => Ok(Self::Padded),
            other => Err(BridgeError::InvalidConfig(format!(
                "unknown frame mode `{other}` (expected line, length-prefixed or padded)"
            ))),
        }
    }
}

impl fmt::Display for FrameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Line => "line",
            Self::LengthPrefixed => "length-prefixed",
            Self::Padded => "padded",
        })
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    // ---
    /// Identifier used in logs and as the broker client id.
    pub transport_id: String,

    /// Transport selection: `"kafka"` or `"memory"`.
    ///
    /// `None` picks Kafka when the crate is built with `transport_rdkafka`,
    /// the in-memory transport otherwise.
    pub transport_type: Option<String>,

    /// Comma-separated broker bootstrap list (e.g. `"kafka-1:9092,kafka-2:9092"`).
    pub brokers: String,

    /// Topic that requests are published to.
    pub request_topic: String,

    /// Topic the external processor publishes responses to.
    pub response_topic: String,

    /// Consumer group used when reading the response topic.
    pub group_id: String,

    /// Where a fresh consumer group starts reading (`latest` or `earliest`).
    pub offset_reset: String,

    /// Message header that carries the correlation token.
    pub header_key: String,

    /// Client-facing TCP listen address.
    pub listen_addr: SocketAddr,

    /// How long a connection handler waits for its response.
    pub request_timeout: Duration,

    /// How long an unclaimed response is kept before it is reaped.
    pub retention: Duration,

    /// Interval between reaper passes over the correlation store.
    pub reap_interval: Duration,

    /// Upper bound for enqueueing a publish and for the broker to confirm it.
    pub flush_timeout: Duration,

    /// Number of publish workers sharing the producer session.
    pub publish_workers: usize,

    /// Capacity of the bounded publish queue.
    pub publish_queue_capacity: usize,

    /// Client frame format.
    pub frame_mode: FrameMode,

    /// Largest accepted request frame, in bytes.
    pub max_frame_len: usize,

    /// Reply written when no response can be delivered.
    pub failure_payload: Bytes,

    /// Backoff used by the subscribe loop and consumer on broker errors.
    pub consume_retry: RetryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport_id: "mom-bridge".to_string(),
            transport_type: None,
            brokers: "localhost:9092".to_string(),
            request_topic: "mpc.json.bifast.request".to_string(),
            response_topic: "mpc.json.bifast.response".to_string(),
            group_id: "mom-bridge".to_string(),
            offset_reset: "latest".to_string(),
            header_key: "uniqueKey".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3380)),
            request_timeout: Duration::from_secs(50),
            retention: Duration::from_secs(120),
            reap_interval: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(3),
            publish_workers: 4,
            publish_queue_capacity: 256,
            frame_mode: FrameMode::Line,
            max_frame_len: 64 * 1024,
            failure_payload: Bytes::from_static(b"fail to get response"),
            consume_retry: RetryConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Configuration for a Kafka-backed bridge.
    pub fn with_brokers(brokers: impl Into<String>) -> Self {
        Self {
            transport_type: Some("kafka".to_string()),
            brokers: brokers.into(),
            ..Self::default()
        }
    }

    /// Configuration for a bridge on the in-memory transport.
    pub fn memory(transport_id: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            transport_type: Some("memory".to_string()),
            ..Self::default()
        }
    }

    pub fn with_topics(mut self, request: impl Into<String>, response: impl Into<String>) -> Self {
        self.request_topic = request.into();
        self.response_topic = response.into();
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_header_key(mut self, key: impl Into<String>) -> Self {
        self.header_key = key.into();
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the per-request deadline.
    ///
    /// Retention is raised to match when it would otherwise be shorter, so
    /// a late response always outlives the handler that could claim it.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.retention = self.retention.max(timeout);
        self
    }

    pub fn with_retention(mut self, retention: Duration, reap_interval: Duration) -> Self {
        self.retention = retention;
        self.reap_interval = reap_interval;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_publish_pool(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.publish_workers = workers;
        self.publish_queue_capacity = queue_capacity;
        self
    }

    pub fn with_framing(mut self, mode: FrameMode, max_frame_len: usize) -> Self {
        self.frame_mode = mode;
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_failure_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.failure_payload = payload.into();
        self
    }

    pub fn with_consume_retry(mut self, retry: RetryConfig) -> Self {
        self.consume_retry = retry;
        self
    }

    /// Check the configuration for values the bridge cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        // ---
        fn invalid(msg: &str) -> Result<()> {
            Err(BridgeError::InvalidConfig(msg.to_string()))
        }

        if self.request_topic.trim().is_empty() || self.response_topic.trim().is_empty() {
            return invalid("request and response topics must be set");
        }
        if self.request_topic == self.response_topic {
            return invalid("request and response topics must differ");
        }
        if self.header_key.is_empty() {
            return invalid("header_key must not be empty");
        }
        if self.request_timeout.is_zero() || self.flush_timeout.is_zero() {
            return invalid("request_timeout and flush_timeout must be non-zero");
        }
        if self.reap_interval.is_zero() {
            return invalid("reap_interval must be non-zero");
        }
        if self.retention < self.request_timeout {
            return invalid("retention must be at least request_timeout");
        }
        if self.publish_workers == 0 || self.publish_queue_capacity == 0 {
            return invalid("publish_workers and publish_queue_capacity must be at least 1");
        }
        if self.max_frame_len == 0 {
            return invalid("max_frame_len must be non-zero");
        }
        if self.transport_type.as_deref() == Some("kafka") && self.brokers.trim().is_empty() {
            return invalid("brokers must be set for the kafka transport");
        }

        Ok(())
    }
}
