//! Response subscribe loop.
//!
//! Glue between the transport and the correlation store. The loop:
//! - subscribes to the response topic
//! - drains the subscription inbox for the lifetime of the bridge
//! - deposits every envelope into the [`CorrelationStore`] by its token
//!
//! ## Keeping pace
//!
//! Depositing is a non-blocking map insert, so the loop never waits on a
//! connection handler. A response whose handler already timed out is stored
//! like any other and later reaped.
//!
//! ## Error handling
//!
//! Subscribe failures and closed subscriptions are logged and retried with
//! exponential backoff. Envelopes without a correlation token are logged and
//! dropped. The loop only exits when the shutdown signal fires.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::retry::Backoff;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    CorrelationStore,
    Envelope,
    RetryConfig,
    Subscription,
    SubscriptionHandle,
    Topic,
    TransportPtr,
};

/// Start the subscribe loop for `topic`.
///
/// The first subscription attempt happens before this function returns, so
/// once it returns `true` any response published afterwards is captured. On
/// `false` the loop keeps retrying in the background; a broker that is down
/// at startup is not fatal.
pub async fn spawn(
    transport: TransportPtr,
    topic: Topic,
    store: CorrelationStore,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
) -> (JoinHandle<()>, bool) {
    // ---
    let sub = Subscription::from(topic);
    let first = subscribe_once(&transport, &sub).await;
    let subscribed = first.is_some();

    let join = tokio::spawn(run(transport, sub, store, retry, shutdown, first));

    (join, subscribed)
}

async fn subscribe_once(transport: &TransportPtr, sub: &Subscription) -> Option<SubscriptionHandle> {
    // ---
    match transport.subscribe(sub.clone()).await {
        Ok(handle) => {
            log_info!("{}: subscribed to {}", transport.transport_id(), sub.0);
            Some(handle)
        }
        Err(_err) => {
            log_warn!("{}: subscribe to {} failed: {_err}", transport.transport_id(), sub.0);
            None
        }
    }
}

async fn run(
    transport: TransportPtr,
    sub: Subscription,
    store: CorrelationStore,
    retry: RetryConfig,
    mut shutdown: watch::Receiver<bool>,
    mut current: Option<SubscriptionHandle>,
) {
    // ---
    let mut backoff = Backoff::new(retry);

    loop {
        if let Some(mut handle) = current.take() {
            backoff.reset();

            loop {
                tokio::select! {
                    env = handle.inbox.recv() => match env {
                        Some(env) => deposit(&store, env),
                        None => break,
                    },
                    _ = shutdown.changed() => {}
                }
                if stopping(&shutdown) {
                    log_debug!("subscribe loop on {} stopping", sub.0);
                    return;
                }
            }

            log_warn!("subscription to {} closed; resubscribing", sub.0);
        }

        if stopping(&shutdown) {
            return;
        }

        let delay = backoff.next_delay();
        log_debug!("retrying subscribe to {} in {delay:?} (attempt {})", sub.0, backoff.attempt());

        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
        if stopping(&shutdown) {
            return;
        }

        current = subscribe_once(&transport, &sub).await;
    }
}

/// True once shutdown was requested or the bridge dropped its sender.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

fn deposit(store: &CorrelationStore, env: Envelope) {
    // ---
    match env.correlation_id {
        Some(id) => {
            log_debug!("response for {id} ({} bytes) from {}", env.payload.len(), env.topic);
            store.put(id, env.payload);
        }
        None => {
            log_warn!("response on {} without correlation token dropped", env.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, CorrelationId, MemoryHub, Result, Transport};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            multiplier: 2.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn test_responses_land_in_store() {
        // ---
        let hub = MemoryHub::new();
        let bridge = create_memory_transport_with_hub("bridge", hub.clone()).await.unwrap();
        let processor = create_memory_transport_with_hub("processor", hub).await.unwrap();

        let store = CorrelationStore::new(Duration::from_secs(60));
        let (_tx, rx) = watch::channel(false);
        let (_join, subscribed) =
            spawn(bridge, Topic::from("responses"), store.clone(), fast_retry(), rx).await;
        assert!(subscribed);

        let id = CorrelationId::generate();
        processor
            .publish(Envelope::response(
                Topic::from("responses"),
                id.clone(),
                Bytes::from_static(b"PONG"),
            ))
            .await
            .unwrap();

        let got = store.wait_and_take(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"PONG"));
    }

    #[tokio::test]
    async fn test_untagged_response_dropped() {
        // ---
        let hub = MemoryHub::new();
        let bridge = create_memory_transport_with_hub("bridge", hub.clone()).await.unwrap();
        let processor = create_memory_transport_with_hub("processor", hub).await.unwrap();

        let store = CorrelationStore::new(Duration::from_secs(60));
        let (_tx, rx) = watch::channel(false);
        let _ = spawn(bridge, Topic::from("responses"), store.clone(), fast_retry(), rx).await;

        let mut env = Envelope::response(
            Topic::from("responses"),
            CorrelationId::generate(),
            Bytes::from_static(b"orphan"),
        );
        env.correlation_id = None;
        processor.publish(env).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());
    }

    /// First subscription is closed right away; later ones go to the hub.
    struct DroppingTransport {
        inner: TransportPtr,
        attempts: AtomicUsize,
        live: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Transport for DroppingTransport {
        fn transport_id(&self) -> &str {
            "dropping"
        }

        async fn publish(&self, env: Envelope) -> Result<()> {
            self.inner.publish(env).await
        }

        async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                let (_tx, inbox) = mpsc::channel(1);
                return Ok(SubscriptionHandle { inbox });
            }
            let handle = self.inner.subscribe(sub).await?;
            self.live.store(true, Ordering::SeqCst);
            Ok(handle)
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_closed_subscription_is_resubscribed() {
        // ---
        let hub = MemoryHub::new();
        let transport = Arc::new(DroppingTransport {
            inner: create_memory_transport_with_hub("bridge", hub.clone()).await.unwrap(),
            attempts: AtomicUsize::new(0),
            live: AtomicBool::new(false),
        });
        let processor = create_memory_transport_with_hub("processor", hub).await.unwrap();

        let store = CorrelationStore::new(Duration::from_secs(60));
        let (_tx, rx) = watch::channel(false);
        let (_join, subscribed) = spawn(
            transport.clone(),
            Topic::from("responses"),
            store.clone(),
            fast_retry(),
            rx,
        )
        .await;
        assert!(subscribed);

        time::timeout(Duration::from_secs(1), async {
            while !transport.live.load(Ordering::SeqCst) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("never resubscribed");
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);

        let id = CorrelationId::generate();
        processor
            .publish(Envelope::response(
                Topic::from("responses"),
                id.clone(),
                Bytes::from_static(b"after-resubscribe"),
            ))
            .await
            .unwrap();

        let got = store.wait_and_take(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&got[..], b"after-resubscribe");
    }

    #[tokio::test]
    async fn test_loop_survives_subscribe_failures_and_stops_on_shutdown() {
        // ---
        let transport = create_memory_transport_with_hub("down", MemoryHub::new())
            .await
            .unwrap();
        transport.close().await.unwrap();

        let store = CorrelationStore::new(Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);
        let (join, subscribed) =
            spawn(transport, Topic::from("responses"), store, fast_retry(), rx).await;
        assert!(!subscribed);

        // Several failed retries later the loop is still alive.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!join.is_finished());

        tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), join)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
