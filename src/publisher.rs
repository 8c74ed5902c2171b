//! Publish path.
//!
//! Connection handlers hand request envelopes to a [`Publisher`]. The
//! publisher feeds a bounded queue drained by a fixed pool of worker tasks,
//! all sharing one transport (and therefore one long-lived producer
//! session). The queue bound is the backpressure: when the broker falls
//! behind, submissions wait up to `flush_timeout` for room and then fail
//! fast instead of piling up unbounded work.
//!
//! Each submission carries a `oneshot` back to the submitting handler, so a
//! delivery failure is reported immediately rather than surfacing as a
//! response timeout later.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::{log_debug, log_warn, BridgeError, Envelope, Result, TransportPtr};

struct PublishJob {
    env: Envelope,
    done: oneshot::Sender<Result<()>>,
}

type JobQueue = Arc<Mutex<mpsc::Receiver<PublishJob>>>;

/// Handle for submitting requests to the publish worker pool.
///
/// Cheap to clone. Workers stop once every handle has been dropped and the
/// queue has drained.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<PublishJob>,
    flush_timeout: Duration,
}

impl Publisher {
    // ---

    /// Start `workers` publish tasks behind a queue of `queue_capacity`.
    ///
    /// Returns the submission handle plus the worker join handles.
    pub fn spawn(
        transport: TransportPtr,
        workers: usize,
        queue_capacity: usize,
        flush_timeout: Duration,
    ) -> (Self, Vec<JoinHandle<()>>) {
        // ---
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let queue: JobQueue = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    transport.clone(),
                    queue.clone(),
                    flush_timeout,
                ))
            })
            .collect();

        (Self { tx, flush_timeout }, handles)
    }

    /// Publish one envelope and wait for the broker's confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Publish`] if the queue stays full for
    /// `flush_timeout`, the pool has stopped, or the transport rejected or
    /// failed to confirm the send.
    pub async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        let (done, confirmed) = oneshot::channel();

        self.tx
            .send_timeout(PublishJob { env, done }, self.flush_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => {
                    BridgeError::Publish("publish queue full".to_string())
                }
                SendTimeoutError::Closed(_) => {
                    BridgeError::Publish("publish workers stopped".to_string())
                }
            })?;

        confirmed
            .await
            .map_err(|_| BridgeError::Publish("publish worker dropped the request".to_string()))?
    }
}

async fn worker_loop(
    worker_id: usize,
    transport: TransportPtr,
    queue: JobQueue,
    flush_timeout: Duration,
) {
    // ---
    log_debug!("publish worker {worker_id} started");

    loop {
        // Hold the queue lock only while waiting for the next job.
        let job = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };

        let Some(PublishJob { env, done }) = job else {
            break;
        };

        let topic = env.topic.clone();
        let result = match time::timeout(flush_timeout, transport.publish(env)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BridgeError::Publish(err.to_string())),
            Err(_elapsed) => Err(BridgeError::Publish(format!(
                "broker did not confirm within {flush_timeout:?}"
            ))),
        };

        if let Err(ref _err) = result {
            log_warn!("worker {worker_id}: publish to {topic} failed: {_err}");
        }

        // The handler may already have given up; nothing to do then.
        let _ = done.send(result);
    }

    log_debug!("publish worker {worker_id} stopped");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport_with_hub, CorrelationId, MemoryHub, Subscription, Topic};
    use crate::{SubscriptionHandle, Transport};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(payload: &'static [u8]) -> Envelope {
        Envelope::request(
            Topic::from("requests"),
            CorrelationId::generate(),
            Bytes::from_static(payload),
        )
    }

    /// Transport whose publish never completes, tracking peak concurrency.
    struct StallingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    /// Decrements the in-flight count when the publish future is dropped.
    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Transport for StallingTransport {
        fn transport_id(&self) -> &str {
            "stalling"
        }

        async fn publish(&self, _env: Envelope) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn subscribe(&self, _sub: Subscription) -> Result<SubscriptionHandle> {
            Err(BridgeError::Transport("unsupported".into()))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_topic() {
        // ---
        let hub = MemoryHub::new();
        let transport = create_memory_transport_with_hub("pub", hub).await.unwrap();
        let mut sub = transport.subscribe("requests".into()).await.unwrap();

        let (publisher, _workers) =
            Publisher::spawn(transport.clone(), 2, 8, Duration::from_secs(1));

        let env = request(b"PING");
        let id = env.correlation_id.clone();
        publisher.publish(env).await.unwrap();

        let got = sub.inbox.recv().await.unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"PING"));
        assert_eq!(got.correlation_id, id);
    }

    #[tokio::test]
    async fn test_transport_failure_reported_immediately() {
        // ---
        let transport = create_memory_transport_with_hub("closed", MemoryHub::new())
            .await
            .unwrap();
        transport.close().await.unwrap();

        let (publisher, _workers) = Publisher::spawn(transport, 1, 8, Duration::from_secs(5));

        let started = std::time::Instant::now();
        let result = publisher.publish(request(b"PING")).await;

        assert!(matches!(result, Err(BridgeError::Publish(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unconfirmed_send_times_out() {
        // ---
        let transport = Arc::new(StallingTransport {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let (publisher, _workers) =
            Publisher::spawn(transport, 1, 8, Duration::from_millis(50));

        let result = publisher.publish(request(b"PING")).await;
        assert!(matches!(result, Err(BridgeError::Publish(_))));
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_pool_and_queue() {
        // ---
        let transport = Arc::new(StallingTransport {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let (publisher, _workers) =
            Publisher::spawn(transport.clone(), 3, 2, Duration::from_millis(200));

        let mut pending = Vec::new();
        for _ in 0..20 {
            let publisher = publisher.clone();
            pending.push(tokio::spawn(async move { publisher.publish(request(b"x")).await }));
        }

        let mut rejected = 0;
        for task in pending {
            if let Err(BridgeError::Publish(_)) = task.await.unwrap() {
                rejected += 1;
            }
        }

        // Every send stalls, so every request fails; never more than the
        // pool size are handed to the transport at once.
        assert_eq!(rejected, 20);
        assert!(transport.peak.load(Ordering::SeqCst) <= 3);
    }
}
