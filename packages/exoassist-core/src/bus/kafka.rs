//! Kafka partitioned-log bus backing (behind the `kafka` feature).
//!
//! Messages are keyed by `interaction_id` so a topic's per-interaction
//! ordering survives partitioning. Consumer groups use manual commits:
//! the offset is committed only after the handler returns without error,
//! giving at-least-once delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{BusError, BusHandler, BusMessage, Envelope, MessageBus, SubscriptionHandle};

/// Kafka backing with consumer groups and commit-after-handler semantics.
pub struct KafkaBus {
    producer: FutureProducer,
    brokers: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl KafkaBus {
    /// Builds the producer; consumers are created per subscription.
    pub fn connect(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self {
            producer,
            brokers: brokers.to_string(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    async fn run_subscription(
        consumer: StreamConsumer,
        topic: String,
        handler: Arc<dyn BusHandler>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = consumer.recv() => match received {
                    Ok(message) => {
                        let Some(Ok(payload)) = message.payload_view::<str>() else {
                            log::warn!("[KafkaBus] Non-UTF8 payload on {}", topic);
                            let _ = consumer.commit_message(&message, CommitMode::Async);
                            continue;
                        };
                        let envelope: Envelope = match serde_json::from_str(payload) {
                            Ok(env) => env,
                            Err(e) => {
                                log::warn!("[KafkaBus] Bad envelope on {}: {}", topic, e);
                                let _ = consumer.commit_message(&message, CommitMode::Async);
                                continue;
                            }
                        };

                        let msg = BusMessage {
                            id: format!("{}-{}", message.partition(), message.offset()),
                            topic: topic.clone(),
                            envelope,
                        };

                        match handler.handle(msg).await {
                            Ok(()) => {
                                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                    log::warn!("[KafkaBus] Commit failed on {}: {}", topic, e);
                                }
                            }
                            Err(e) => {
                                // Uncommitted: redelivered after rebalance/restart.
                                log::warn!("[KafkaBus] Handler failed on {}: {}", topic, e);
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[KafkaBus] Receive failed on {}: {}", topic, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }

        log::debug!("[KafkaBus] Subscription loop ended: {}", topic);
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<String, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let payload =
            serde_json::to_string(&envelope).map_err(|e| BusError::Publish(e.to_string()))?;
        let record = FutureRecord::to(topic)
            .key(&envelope.interaction_id)
            .payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| BusError::Publish(e.to_string()))?;

        Ok(format!("{partition}-{offset}"))
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| BusError::Connection(e.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let cancel = self.cancel.child_token();
        let task = self.tracker.spawn(Self::run_subscription(
            consumer,
            topic.to_string(),
            handler,
            cancel.clone(),
        ));

        log::info!("[KafkaBus] Subscribed {} as group {}", topic, group);
        Ok(SubscriptionHandle::new(cancel, Some(task)))
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("[KafkaBus] Closed");
    }
}
