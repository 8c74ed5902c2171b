use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use mom_bridge::{create_transport, Bridge, BridgeConfig, FrameMode};
use tracing_subscriber::EnvFilter;

/// Bridge synchronous TCP clients onto a publish/subscribe broker.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Client-facing listen address
    #[arg(long, env = "MOM_BRIDGE_LISTEN", default_value = "0.0.0.0:3380")]
    listen: SocketAddr,

    /// Transport backend (`kafka` or `memory`)
    #[arg(long, env = "MOM_BRIDGE_TRANSPORT")]
    transport: Option<String>,

    /// Comma-separated broker bootstrap list
    #[arg(long, env = "MOM_BRIDGE_BROKERS", default_value = "localhost:9092")]
    brokers: String,

    /// Topic requests are published to
    #[arg(long, env = "MOM_BRIDGE_REQUEST_TOPIC", default_value = "mpc.json.bifast.request")]
    request_topic: String,

    /// Topic responses are read from
    #[arg(long, env = "MOM_BRIDGE_RESPONSE_TOPIC", default_value = "mpc.json.bifast.response")]
    response_topic: String,

    /// Consumer group for the response topic
    #[arg(long, env = "MOM_BRIDGE_GROUP_ID", default_value = "mom-bridge")]
    group_id: String,

    /// Start offset for a new consumer group (`latest` or `earliest`)
    #[arg(long, env = "MOM_BRIDGE_OFFSET_RESET", default_value = "latest")]
    offset_reset: String,

    /// Message header carrying the correlation token
    #[arg(long, env = "MOM_BRIDGE_HEADER_KEY", default_value = "uniqueKey")]
    header_key: String,

    /// Client id reported to the broker and used in logs
    #[arg(long, env = "MOM_BRIDGE_CLIENT_ID", default_value = "mom-bridge")]
    client_id: String,

    /// Per-request deadline, in seconds
    #[arg(long, env = "MOM_BRIDGE_REQUEST_TIMEOUT_SECS", default_value_t = 50)]
    request_timeout_secs: u64,

    /// How long unclaimed responses are kept, in seconds
    #[arg(long, env = "MOM_BRIDGE_RETENTION_SECS", default_value_t = 120)]
    retention_secs: u64,

    /// Broker publish confirmation deadline, in milliseconds
    #[arg(long, env = "MOM_BRIDGE_FLUSH_TIMEOUT_MS", default_value_t = 3000)]
    flush_timeout_ms: u64,

    /// Number of publish workers
    #[arg(long, env = "MOM_BRIDGE_PUBLISH_WORKERS", default_value_t = 4)]
    publish_workers: usize,

    /// Publish queue capacity
    #[arg(long, env = "MOM_BRIDGE_PUBLISH_QUEUE", default_value_t = 256)]
    publish_queue: usize,

    /// Client framing: `line`, `length-prefixed` or `padded`
    #[arg(long, env = "MOM_BRIDGE_FRAMING", default_value = "line")]
    framing: FrameMode,

    /// Largest accepted request frame, in bytes
    #[arg(long, env = "MOM_BRIDGE_MAX_FRAME", default_value_t = 65536)]
    max_frame: usize,

    /// Reply sent when no response can be delivered
    #[arg(long, env = "MOM_BRIDGE_FAILURE_PAYLOAD", default_value = "fail to get response")]
    failure_payload: String,
}

impl Cli {
    fn into_config(self) -> BridgeConfig {
        // ---
        let mut config = BridgeConfig::with_brokers(self.brokers)
            .with_topics(self.request_topic, self.response_topic)
            .with_group_id(self.group_id)
            .with_header_key(self.header_key)
            .with_listen_addr(self.listen)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_flush_timeout(Duration::from_millis(self.flush_timeout_ms))
            .with_publish_pool(self.publish_workers, self.publish_queue)
            .with_framing(self.framing, self.max_frame)
            .with_failure_payload(Bytes::from(self.failure_payload));

        // Explicit retention; validation rejects one shorter than the deadline.
        config.retention = Duration::from_secs(self.retention_secs);
        config.transport_id = self.client_id;
        config.transport_type = self.transport;
        config.offset_reset = self.offset_reset;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Cli::parse().into_config();
    config.validate().context("invalid configuration")?;

    let transport = create_transport(&config)
        .await
        .context("failed to create transport")?;

    let bridge = Bridge::start(config, transport)
        .await
        .context("failed to start bridge")?;

    tracing::info!("mom-bridge ready on {}", bridge.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    bridge.shutdown().await.context("shutdown failed")?;

    Ok(())
}
