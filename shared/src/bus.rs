use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::messages::{DomainEvent, EventKind};

/// Pause before re-polling a message that failed transiently, so a broken
/// downstream does not turn redelivery into a hot loop.
const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How message handling ended, as far as the broker is concerned. Business
/// rejections are not errors at this layer; handlers record them and return
/// `Ok` so the message is acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Infrastructure fault; the message is requeued and redelivered.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// The message itself cannot be processed; it is dead-lettered.
    #[error("poison message: {0}")]
    Poison(String),
}

#[derive(Clone)]
pub struct MessageBus {
    producer: FutureProducer,
}

impl MessageBus {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create Kafka producer")?;

        Ok(Self { producer })
    }

    /// Publishes an event to the durable topic named after its kind, keyed
    /// by order id. Returns only once the broker has accepted the record.
    pub async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let key = event.order_id().to_string();
        let record = FutureRecord::to(event.kind().topic())
            .payload(&payload)
            .key(&key);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to publish {}: {}", event.kind(), e))?;

        Ok(())
    }

    async fn dead_letter(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<()> {
        let dlq = format!("{}.dead-letter", topic);
        let record = FutureRecord::to(&dlq).payload(payload).key(key);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to dead-letter to {}: {}", dlq, e))?;

        Ok(())
    }
}

/// Builds a consumer with manual offset commits, so acknowledgment is under
/// the subscription loop's control rather than the client's timer.
pub fn manual_consumer(brokers: &str, group_id: &str) -> Result<StreamConsumer> {
    ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .create()
        .context("failed to create Kafka consumer")
}

/// Subscribes to the topics for `kinds` and delivers messages to `handler`
/// strictly one at a time. Handler `Ok` commits the offset; a transient
/// failure seeks back to the same offset so the broker redelivers it; an
/// undeserializable payload or a poison verdict goes to the topic's
/// dead-letter shadow and is committed, so it is never redelivered.
///
/// Returns when the shutdown signal fires; the in-flight message is always
/// either fully handled or left uncommitted, never half-acknowledged.
pub async fn consume<H>(
    consumer: StreamConsumer,
    bus: MessageBus,
    kinds: &[EventKind],
    mut shutdown: watch::Receiver<bool>,
    handler: H,
) -> Result<()>
where
    H: Fn(DomainEvent) -> BoxFuture<'static, Result<(), ConsumeError>>,
{
    let topics: Vec<&str> = kinds.iter().map(|k| k.topic()).collect();
    consumer
        .subscribe(&topics)
        .context("failed to subscribe")?;
    info!(?topics, "consumer started");

    let mut stream = consumer.stream();
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = stream.next() => next,
        };
        let message = match next {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                error!(error = %e, "error receiving message");
                continue;
            }
            None => break,
        };

        let payload = message.payload().unwrap_or_default();
        let outcome = match serde_json::from_slice::<DomainEvent>(payload) {
            Ok(event) => handler(event).await,
            Err(e) => Err(ConsumeError::Poison(format!("undeserializable payload: {e}"))),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    error!(error = %e, "error committing message");
                }
            }
            Err(ConsumeError::Transient(e)) => {
                warn!(
                    topic = message.topic(),
                    offset = message.offset(),
                    error = %e,
                    "handler failed; requeueing message"
                );
                if let Err(e) = consumer.seek(
                    message.topic(),
                    message.partition(),
                    Offset::Offset(message.offset()),
                    SEND_TIMEOUT,
                ) {
                    error!(error = %e, "error seeking back for redelivery");
                }
                tokio::time::sleep(REDELIVERY_BACKOFF).await;
            }
            Err(ConsumeError::Poison(reason)) => {
                error!(
                    topic = message.topic(),
                    offset = message.offset(),
                    %reason,
                    "dead-lettering message"
                );
                if let Err(e) = bus
                    .dead_letter(message.topic(), message.key().unwrap_or_default(), payload)
                    .await
                {
                    error!(error = %e, "error writing to dead-letter topic");
                }
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    error!(error = %e, "error committing dead-lettered message");
                }
            }
        }
    }

    info!("consumer stopped");
    Ok(())
}
