// tests/common/mod.rs

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use mom_bridge::{
    // ---
    create_memory_transport_with_hub,
    Bridge,
    BridgeConfig,
    BridgeError,
    Envelope,
    MemoryHub,
    Result,
    Subscription,
    SubscriptionHandle,
    Topic,
    Transport,
    TransportPtr,
};

pub const REQUEST_TOPIC: &str = "test.request";
pub const RESPONSE_TOPIC: &str = "test.response";

pub fn init_logging() {
    // ---
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bridge configuration on an ephemeral loopback port with test topics.
pub fn test_config(id: &str) -> BridgeConfig {
    // ---
    BridgeConfig::memory(id)
        .with_topics(REQUEST_TOPIC, RESPONSE_TOPIC)
        .with_listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_request_timeout(Duration::from_secs(2))
        .with_flush_timeout(Duration::from_millis(500))
}

pub async fn start_bridge(hub: Arc<MemoryHub>, config: BridgeConfig) -> Bridge {
    // ---
    let transport = create_memory_transport_with_hub(&config.transport_id, hub)
        .await
        .expect("memory transport");

    Bridge::start(config, transport).await.expect("bridge start")
}

/// What the simulated external processor does with one request.
pub enum Reply {
    Now(Bytes),
    After(Duration, Bytes),
    Never,
}

/// Simulated external processor: consumes the request topic and answers on
/// the response topic with the request's correlation token.
///
/// Subscribed before this returns, so no request published afterwards is
/// missed.
pub async fn spawn_processor<F>(hub: Arc<MemoryHub>, script: F) -> JoinHandle<()>
where
    F: Fn(&Bytes) -> Reply + Send + Sync + 'static,
{
    // ---
    let transport = create_memory_transport_with_hub("processor", hub)
        .await
        .expect("processor transport");

    let mut sub = transport
        .subscribe(REQUEST_TOPIC.into())
        .await
        .expect("processor subscribe");

    tokio::spawn(async move {
        while let Some(env) = sub.inbox.recv().await {
            let Some(id) = env.correlation_id.clone() else {
                continue;
            };

            let (delay, payload) = match script(&env.payload) {
                Reply::Now(payload) => (Duration::ZERO, payload),
                Reply::After(delay, payload) => (delay, payload),
                Reply::Never => continue,
            };

            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = transport
                    .publish(Envelope::response(Topic::from(RESPONSE_TOPIC), id, payload))
                    .await;
            });
        }
    })
}

/// Transport that subscribes normally but refuses every publish.
pub struct RejectingTransport {
    pub inner: TransportPtr,
}

#[async_trait::async_trait]
impl Transport for RejectingTransport {
    fn transport_id(&self) -> &str {
        "rejecting"
    }

    async fn publish(&self, _env: Envelope) -> Result<()> {
        Err(BridgeError::Transport("broker unavailable".to_string()))
    }

    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
        self.inner.subscribe(sub).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Line-mode client connection.
pub struct LineClient {
    reader: BufReader<TcpStream>,
}

impl LineClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send one request line and read one reply line (without the newline).
    pub async fn request(&mut self, payload: &str) -> String {
        // ---
        let stream = self.reader.get_mut();
        stream.write_all(payload.as_bytes()).await.expect("write");
        stream.write_all(b"\n").await.expect("write");

        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read");
        line.trim_end_matches('\n').to_string()
    }
}
