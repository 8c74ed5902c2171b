use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::retry::Backoff;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    BridgeConfig,
    BridgeError,
    CorrelationId,
    Envelope,
    Result,
    RetryConfig,
    Subscription,
    SubscriptionHandle,
    Topic,
    Transport,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 256;

/// Settings the consumer tasks need, copied out of [`BridgeConfig`].
#[derive(Clone)]
struct ConsumerSettings {
    brokers: String,
    group_id: String,
    offset_reset: String,
    header_key: String,
    retry: RetryConfig,
}

pub struct KafkaTransport {
    // ---
    transport_id: String,
    producer: FutureProducer,
    consumer: ConsumerSettings,
    flush_timeout: Duration,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl KafkaTransport {
    // ---
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Transport(format!(
                "{}: transport is closed",
                self.transport_id
            )));
        }
        Ok(())
    }

    fn create_consumer(&self, topic: &Topic) -> Result<StreamConsumer> {
        // ---
        let settings = &self.consumer;
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("group.id", &settings.group_id)
            .set("client.id", &self.transport_id)
            .set("auto.offset.reset", &settings.offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|err| BridgeError::Transport(format!("failed to create consumer: {err}")))?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|err| BridgeError::Transport(format!("subscribe to {topic} failed: {err}")))?;

        Ok(consumer)
    }
}

#[async_trait::async_trait]
impl Transport for KafkaTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        self.ensure_open()?;

        let Some(id) = env.correlation_id.as_ref() else {
            return Err(BridgeError::Publish(
                "request envelope has no correlation id".to_string(),
            ));
        };

        let headers = OwnedHeaders::new().insert(Header {
            key: self.consumer.header_key.as_str(),
            value: Some(id.as_bytes()),
        });

        let record = FutureRecord::to(env.topic.as_str())
            .key(id.as_bytes())
            .payload(&env.payload[..])
            .headers(headers);

        let (_partition, _offset) = self
            .producer
            .send(record, Timeout::After(self.flush_timeout))
            .await
            .map_err(|(err, _msg)| BridgeError::Publish(err.to_string()))?;

        log_debug!(
            "{}: {id} delivered to {} [{_partition}] @ {_offset}",
            self.transport_id,
            env.topic
        );
        Ok(())
    }

    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_open()?;

        let topic = sub.0;
        let consumer = self.create_consumer(&topic)?;
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);

        tokio::spawn(consume_loop(
            self.transport_id.clone(),
            consumer,
            topic,
            self.consumer.clone(),
            tx,
            self.shutdown.subscribe(),
        ));

        Ok(SubscriptionHandle { inbox })
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        log_info!("{}: closing kafka transport", self.transport_id);
        let _ = self.shutdown.send(true);

        self.producer
            .flush(Timeout::After(self.flush_timeout))
            .map_err(|err| BridgeError::Transport(format!("flush failed: {err}")))
    }
}

/// Drain one consumer into a subscription inbox until shutdown or until the
/// subscriber goes away.
async fn consume_loop(
    transport_id: String,
    consumer: StreamConsumer,
    topic: Topic,
    settings: ConsumerSettings,
    tx: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    let mut backoff = Backoff::new(settings.retry.clone());
    log_debug!("{transport_id}: consumer for {topic} started");

    loop {
        let received = tokio::select! {
            msg = consumer.recv() => msg.map(|msg| to_envelope(&msg, &topic, &settings.header_key)),
            _ = shutdown.changed() => break,
        };

        match received {
            Ok(env) => {
                backoff.reset();
                if tx.send(env).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _err = consume_error(&topic, err);
                let delay = backoff.next_delay();
                log_warn!("{transport_id}: {_err}; retrying in {delay:?}");

                tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    log_debug!("{transport_id}: consumer for {topic} stopped");
}

fn consume_error(topic: &Topic, err: KafkaError) -> BridgeError {
    BridgeError::Consume(format!("{topic}: {err}"))
}

fn to_envelope<M: Message>(msg: &M, topic: &Topic, header_key: &str) -> Envelope {
    // ---
    let from_header = msg.headers().and_then(|headers| {
        (0..headers.count())
            .map(|idx| headers.get(idx))
            .find(|header| header.key == header_key)
            .and_then(|header| header.value)
            .and_then(CorrelationId::from_metadata)
    });

    let correlation_id = from_header.or_else(|| msg.key().and_then(CorrelationId::from_metadata));

    Envelope {
        topic: topic.clone(),
        payload: msg.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
        correlation_id,
    }
}

/// Create a Kafka transport from the bridge configuration.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] if the producer cannot be created
/// (invalid broker list or client settings).
pub async fn create_transport(config: &BridgeConfig) -> Result<TransportPtr> {
    // ---
    let timeout_ms = config.flush_timeout.as_millis().max(1).to_string();

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("client.id", &config.transport_id)
        .set("message.timeout.ms", &timeout_ms)
        .set("acks", "1")
        .create()
        .map_err(|err| BridgeError::Transport(format!("failed to create producer: {err}")))?;

    log_info!(
        "{}: kafka producer ready for {}",
        config.transport_id,
        config.brokers
    );

    let (shutdown, _) = watch::channel(false);

    Ok(Arc::new(KafkaTransport {
        transport_id: config.transport_id.clone(),
        producer,
        consumer: ConsumerSettings {
            brokers: config.brokers.clone(),
            group_id: config.group_id.clone(),
            offset_reset: config.offset_reset.clone(),
            header_key: config.header_key.clone(),
            retry: config.consume_retry.clone(),
        },
        flush_timeout: config.flush_timeout,
        closed: AtomicBool::new(false),
        shutdown,
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rdkafka::message::OwnedMessage;
    use rdkafka::Timestamp;

    fn message(key: Option<&str>, headers: Option<OwnedHeaders>) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"PONG".to_vec()),
            key.map(|k| k.as_bytes().to_vec()),
            "responses".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            headers,
        )
    }

    #[test]
    fn test_token_read_from_header() {
        // ---
        let headers = OwnedHeaders::new().insert(Header {
            key: "uniqueKey",
            value: Some("from-header"),
        });
        let env = to_envelope(
            &message(Some("from-key"), Some(headers)),
            &Topic::from("responses"),
            "uniqueKey",
        );

        assert_eq!(env.correlation_id, Some(CorrelationId::from("from-header")));
        assert_eq!(&env.payload[..], b"PONG");
    }

    #[test]
    fn test_token_falls_back_to_key() {
        // ---
        let headers = OwnedHeaders::new().insert(Header {
            key: "other",
            value: Some("ignored"),
        });
        let env = to_envelope(
            &message(Some("from-key"), Some(headers)),
            &Topic::from("responses"),
            "uniqueKey",
        );

        assert_eq!(env.correlation_id, Some(CorrelationId::from("from-key")));
    }

    #[test]
    fn test_read_error_reported_as_consume() {
        // ---
        let err = consume_error(&Topic::from("responses"), KafkaError::NoMessageReceived);
        match err {
            BridgeError::Consume(msg) => assert!(msg.starts_with("responses: ")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_untagged_message_has_no_token() {
        // ---
        let env = to_envelope(&message(None, None), &Topic::from("responses"), "uniqueKey");
        assert!(env.correlation_id.is_none());
    }
}
