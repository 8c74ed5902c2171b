// src/transport/memory/transport.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, RwLock};

use crate::{
    // ---
    log_debug,
    BridgeError,
    Envelope,
    Result,
    Subscription,
    SubscriptionHandle,
    Topic,
    Transport,
    TransportPtr,
};

/// Inbox depth per subscriber.
const INBOX_CAPACITY: usize = 256;

/// One registered subscriber: the owning transport plus its inbox sender.
struct Subscriber {
    owner: String,
    tx: mpsc::Sender<Envelope>,
}

/// Shared message bus for the in-memory transport.
///
/// All `MemoryTransport` instances sharing a hub see each other's messages,
/// exactly as clients of one broker would. Tests construct a private hub so
/// that parallel test cases stay isolated.
pub struct MemoryHub {
    // ---
    topics: RwLock<HashMap<Topic, Vec<Subscriber>>>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
        })
    }

    async fn publish(&self, transport_id: &str, env: Envelope) -> Result<()> {
        // ---
        let senders: Vec<mpsc::Sender<Envelope>> = {
            let topics = self.topics.read().await;
            match topics.get(&env.topic) {
                Some(subs) => subs.iter().map(|s| s.tx.clone()).collect(),
                None => Vec::new(),
            }
        };

        if senders.is_empty() {
            log_debug!("{transport_id}: no subscribers on {}, message dropped", env.topic);
            return Ok(());
        }

        for tx in senders {
            // A closed channel indicates a dropped SubscriptionHandle.
            if tx.send(env.clone()).await.is_err() {
                log_debug!("{transport_id}: subscriber on {} went away", env.topic);
            }
        }

        Ok(())
    }

    async fn subscribe(&self, transport_id: &str, sub: Subscription) -> SubscriptionHandle {
        // ---
        log_debug!("{transport_id}: subscribe to {}", sub.0);

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        let mut topics = self.topics.write().await;
        let subs = topics.entry(sub.0).or_default();
        subs.retain(|s| !s.tx.is_closed());
        subs.push(Subscriber {
            owner: transport_id.to_string(),
            tx,
        });

        SubscriptionHandle { inbox: rx }
    }

    /// Drop every subscription owned by `transport_id`, closing their inboxes.
    async fn release(&self, transport_id: &str) {
        // ---
        let mut topics = self.topics.write().await;
        for subs in topics.values_mut() {
            subs.retain(|s| s.owner != transport_id);
        }
        topics.retain(|_, subs| !subs.is_empty());
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport bound to one [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Transport(format!(
                "{}: transport is closed",
                self.transport_id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.hub.publish(&self.transport_id, env).await
    }

    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        Ok(self.hub.subscribe(&self.transport_id, sub).await)
    }

    /// Close the transport.
    ///
    /// Only this transport's subscriptions are released; other transports on
    /// the same hub are unaffected.
    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing memory transport", self.transport_id);
        self.closed.store(true, Ordering::Release);
        self.hub.release(&self.transport_id).await;
        Ok(())
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(transport_id: &str) -> Result<TransportPtr> {
    // ---
    create_memory_transport_with_hub(transport_id, global_hub()).await
}

/// Create a new in-memory transport on an explicitly constructed hub.
///
/// Transports that should talk to each other (the bridge and a simulated
/// external processor, for example) must share the hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_hub(
    transport_id: &str,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{transport_id}: create memory transport");

    Ok(Arc::new(MemoryTransport {
        transport_id: transport_id.to_string(),
        hub,
        closed: AtomicBool::new(false),
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::CorrelationId;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_close_releases_only_own_subscriptions() {
        // ---
        let hub = MemoryHub::new();
        let a = create_memory_transport_with_hub("a", hub.clone()).await.unwrap();
        let b = create_memory_transport_with_hub("b", hub.clone()).await.unwrap();

        let mut sub_a = a.subscribe("t".into()).await.unwrap();
        let mut sub_b = b.subscribe("t".into()).await.unwrap();

        a.close().await.unwrap();

        // a's inbox closes, b keeps receiving.
        assert!(sub_a.inbox.recv().await.is_none());

        b.publish(Envelope::request(
            Topic::from("t"),
            CorrelationId::generate(),
            Bytes::from_static(b"x"),
        ))
        .await
        .unwrap();

        let got = timeout(Duration::from_millis(100), sub_b.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_operations() {
        // ---
        let t = create_memory_transport_with_hub("c", MemoryHub::new())
            .await
            .unwrap();
        t.close().await.unwrap();

        let env = Envelope::request(Topic::from("t"), CorrelationId::generate(), Bytes::new());
        assert!(matches!(t.publish(env).await, Err(BridgeError::Transport(_))));
        assert!(matches!(
            t.subscribe("t".into()).await,
            Err(BridgeError::Transport(_))
        ));
    }
}
