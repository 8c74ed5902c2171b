//! Bridge wiring.
//!
//! [`Bridge`] owns every long-running piece of the process and ties their
//! lifetimes together:
//!
//! - the correlation store and its reaper
//! - the response subscribe loop
//! - the publish worker pool
//! - the client-facing listener
//!
//! All of them watch one shutdown channel. [`Bridge::shutdown`] flips it,
//! waits for the tasks to stop and closes the transport.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::server::HandlerContext;
use crate::{
    // ---
    log_error,
    log_info,
    log_warn,
    subscriber,
    BridgeConfig,
    BridgeServer,
    CorrelationStore,
    Publisher,
    Result,
    Topic,
    TransportPtr,
};

/// A running bridge.
pub struct Bridge {
    // ---
    transport: TransportPtr,
    store: CorrelationStore,
    local_addr: SocketAddr,
    flush_timeout: Duration,

    shutdown_tx: watch::Sender<bool>,
    publisher: Publisher,

    server_task: JoinHandle<()>,
    subscriber_task: JoinHandle<()>,
    reaper_task: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Bridge {
    // ---

    /// Validate `config`, bind the listener and start every background task.
    ///
    /// The response subscription is attempted before the listener starts
    /// accepting; if the broker is unreachable the subscribe loop keeps
    /// retrying in the background.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::InvalidConfig`](crate::BridgeError::InvalidConfig) if
    ///   validation fails.
    /// - [`BridgeError::Bind`](crate::BridgeError::Bind) if the listen
    ///   address is unavailable.
    pub async fn start(config: BridgeConfig, transport: TransportPtr) -> Result<Self> {
        // ---
        config.validate()?;

        let store = CorrelationStore::new(config.retention);
        let (publisher, workers) = Publisher::spawn(
            transport.clone(),
            config.publish_workers,
            config.publish_queue_capacity,
            config.flush_timeout,
        );

        let ctx = HandlerContext {
            store: store.clone(),
            publisher: publisher.clone(),
            request_topic: Topic::from(config.request_topic.as_str()),
            request_timeout: config.request_timeout,
            failure_payload: config.failure_payload.clone(),
            frame_mode: config.frame_mode,
            max_frame_len: config.max_frame_len,
        };

        // On failure the publisher handles drop here and the workers drain out.
        let server = BridgeServer::bind(config.listen_addr, ctx).await?;
        let local_addr = server.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reaper_task = store.spawn_reaper(config.reap_interval, shutdown_rx.clone());

        let (subscriber_task, subscribed) = subscriber::spawn(
            transport.clone(),
            Topic::from(config.response_topic.as_str()),
            store.clone(),
            config.consume_retry.clone(),
            shutdown_rx.clone(),
        )
        .await;

        if !subscribed {
            log_warn!(
                "{}: response topic {} not subscribed yet; retrying in background",
                transport.transport_id(),
                config.response_topic
            );
        }

        let server_task = tokio::spawn(server.run(shutdown_rx));

        log_info!(
            "{}: bridging {local_addr} -> {} / {} ({} mode)",
            transport.transport_id(),
            config.request_topic,
            config.response_topic,
            config.frame_mode
        );

        Ok(Self {
            transport,
            store,
            local_addr,
            flush_timeout: config.flush_timeout,
            shutdown_tx,
            publisher,
            server_task,
            subscriber_task,
            reaper_task,
            workers,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The correlation store, for inspection and counters.
    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    /// Stop accepting connections, stop the background tasks and close the
    /// transport.
    ///
    /// Connections still mid-request keep their own publisher handle and
    /// finish on their own; the workers are given `flush_timeout` to drain
    /// before the transport closes underneath them.
    pub async fn shutdown(self) -> Result<()> {
        // ---
        let Self {
            transport,
            flush_timeout,
            shutdown_tx,
            publisher,
            server_task,
            subscriber_task,
            reaper_task,
            workers,
            ..
        } = self;

        log_info!("{}: shutting down", transport.transport_id());
        let _ = shutdown_tx.send(true);

        let _ = server_task.await;
        let _ = subscriber_task.await;
        let _ = reaper_task.await;

        drop(publisher);
        let drained = time::timeout(flush_timeout, futures::future::join_all(workers)).await;
        if drained.is_err() {
            log_warn!("publish workers still busy after {flush_timeout:?}; closing anyway");
        }

        if let Err(err) = transport.close().await {
            log_error!("{}: transport close failed: {err}", transport.transport_id());
            return Err(err);
        }
        Ok(())
    }
}
