//! Pluggable pub/sub transport.
//!
//! Provides a typed publish/subscribe interface abstracting three backings:
//!
//! - [`redis::RedisStreamsBus`]: append-only Redis Streams with consumer
//!   groups (primary; at-least-once, explicit ack)
//! - `kafka::KafkaBus`: partitioned log with consumer groups, commit after
//!   a successful handler (behind the `kafka` cargo feature)
//! - [`memory::MemoryBus`]: synchronous in-process delivery for tests
//!
//! Delivery is at-least-once on the stream backings; consumers must be
//! idempotent on `(interaction_id, seq)`. Ordering is preserved per topic;
//! no cross-topic ordering is guaranteed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::BusConfig;
use crate::error::{AssistError, AssistResult};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod redis;

/// Bus backing selection (`PUBSUB_ADAPTER`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusAdapter {
    /// Redis Streams with consumer groups.
    Streams,
    /// Kafka partitioned log.
    Log,
    /// In-process synchronous delivery.
    Memory,
}

impl Default for BusAdapter {
    fn default() -> Self {
        Self::Memory
    }
}

impl BusAdapter {
    /// Parses the `PUBSUB_ADAPTER` environment value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "streams" | "redis" => Some(Self::Streams),
            "log" | "kafka" => Some(Self::Log),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("message decode failed: {0}")]
    Decode(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("bus is closed")]
    Closed,
}

/// Standard envelope carried by every bus message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub interaction_id: String,
    pub tenant_id: String,
    pub timestamp_ms: u64,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wraps a serializable payload in a stamped envelope.
    pub fn new<T: Serialize>(
        interaction_id: &str,
        tenant_id: &str,
        payload: &T,
    ) -> Result<Self, BusError> {
        Ok(Self {
            trace_id: None,
            interaction_id: interaction_id.to_string(),
            tenant_id: tenant_id.to_string(),
            timestamp_ms: crate::utils::now_millis(),
            payload: serde_json::to_value(payload).map_err(|e| BusError::Decode(e.to_string()))?,
        })
    }

    /// Attaches a trace id for cross-component correlation.
    #[must_use]
    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Decodes the payload into a concrete message type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| BusError::Decode(e.to_string()))
    }
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Backing-assigned message id.
    pub id: String,
    pub topic: String,
    pub envelope: Envelope,
}

/// Handler invoked once per delivered message.
///
/// Returning an error means the message is NOT acknowledged; stream
/// backings will redeliver it.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, msg: BusMessage) -> Result<(), BusError>;
}

/// Handle to an active subscription.
///
/// Dropping the handle does not stop delivery; call [`SubscriptionHandle::close`]
/// to cancel the subscription and drain the in-flight handler.
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        cancel: CancellationToken,
        task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self {
            cancel,
            task: parking_lot::Mutex::new(task),
        }
    }

    /// Cancels the subscription and waits for its delivery loop to finish.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Whether the subscription has been cancelled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Typed publish/subscribe interface over one of the backings.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes an envelope, returning the backing's message id.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<String, BusError>;

    /// Subscribes a handler with consumer-group semantics where supported.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<SubscriptionHandle, BusError>;

    /// Stops all subscriptions, draining in-flight handlers before returning.
    async fn close(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Topic Conventions
// ─────────────────────────────────────────────────────────────────────────────

/// Topic name helpers shared by producers and consumers.
pub mod topics {
    /// Shared call-end topic.
    pub const CALL_END: &str = "call_end";

    /// Shared audio topic used when per-tenant partitioning is off.
    pub const AUDIO_SHARED: &str = "audio_stream";

    /// Audio topic for a tenant (or the shared stream, a deployment choice).
    #[must_use]
    pub fn audio(shared: bool, tenant_id: &str) -> String {
        if shared {
            AUDIO_SHARED.to_string()
        } else {
            format!("audio.{tenant_id}")
        }
    }

    /// Per-interaction transcript topic.
    #[must_use]
    pub fn transcript(interaction_id: &str) -> String {
        format!("transcript.{interaction_id}")
    }

    /// Per-interaction intent topic.
    #[must_use]
    pub fn intent(interaction_id: &str) -> String {
        format!("intent.{interaction_id}")
    }
}

/// Builds the configured bus backing.
///
/// # Errors
///
/// Returns a configuration error when the selected backing is unavailable
/// (e.g. Redis unreachable, or the `kafka` feature not compiled in).
pub async fn create_bus(config: &BusConfig) -> AssistResult<Arc<dyn MessageBus>> {
    match config.adapter {
        BusAdapter::Memory => Ok(Arc::new(memory::MemoryBus::new())),
        BusAdapter::Streams => {
            let bus = redis::RedisStreamsBus::connect(&config.redis_url)
                .await
                .map_err(|e| AssistError::Configuration(format!("redis bus: {e}")))?;
            Ok(Arc::new(bus))
        }
        #[cfg(feature = "kafka")]
        BusAdapter::Log => {
            let bus = kafka::KafkaBus::connect(&config.kafka_brokers)
                .map_err(|e| AssistError::Configuration(format!("kafka bus: {e}")))?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "kafka"))]
        BusAdapter::Log => Err(AssistError::Configuration(
            "partitioned-log backing requires the `kafka` feature".to_string(),
        )),
    }
}
