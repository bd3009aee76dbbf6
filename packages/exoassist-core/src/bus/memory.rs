//! In-memory bus backing.
//!
//! Synchronous in-process delivery with consumer-group semantics: each
//! group receives every message exactly once, round-robin across the
//! group's subscribers. Ack is a no-op. Used by tests and single-process
//! development deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::{BusError, BusHandler, BusMessage, Envelope, MessageBus, SubscriptionHandle};

struct Subscriber {
    group: String,
    handler: Arc<dyn BusHandler>,
    cancel: CancellationToken,
}

struct Topic {
    subscribers: Vec<Arc<Subscriber>>,
    /// Round-robin cursor per group.
    cursors: HashMap<String, Arc<AtomicUsize>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            cursors: HashMap::new(),
        }
    }
}

/// Synchronous in-process bus.
pub struct MemoryBus {
    topics: RwLock<HashMap<String, Topic>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Selects one live subscriber per group for a delivery round.
    fn pick_targets(&self, topic: &str) -> Vec<Arc<Subscriber>> {
        let mut topics = self.topics.write();
        let Some(entry) = topics.get_mut(topic) else {
            return Vec::new();
        };

        // Drop subscribers whose handles were closed.
        entry.subscribers.retain(|s| !s.cancel.is_cancelled());

        let mut by_group: HashMap<&str, Vec<&Arc<Subscriber>>> = HashMap::new();
        for sub in &entry.subscribers {
            by_group.entry(sub.group.as_str()).or_default().push(sub);
        }

        let mut targets = Vec::with_capacity(by_group.len());
        for (group, members) in by_group {
            let cursor = entry
                .cursors
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone();
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(Arc::clone(members[idx]));
        }
        targets
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<String, BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let targets = self.pick_targets(topic);

        for sub in targets {
            let msg = BusMessage {
                id: id.clone(),
                topic: topic.to_string(),
                envelope: envelope.clone(),
            };
            // Synchronous delivery: the publisher observes handler latency,
            // which is exactly what deterministic tests want. Errors are
            // logged; there is no pending list to redeliver from.
            if let Err(e) = sub.handler.handle(msg).await {
                log::warn!("[MemoryBus] Handler failed on {}: {}", topic, e);
            }
        }

        Ok(id)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }

        let cancel = self.closed.child_token();
        let subscriber = Arc::new(Subscriber {
            group: group.to_string(),
            handler,
            cancel: cancel.clone(),
        });

        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .subscribers
            .push(subscriber);

        Ok(SubscriptionHandle::new(cancel, None))
    }

    async fn close(&self) {
        self.closed.cancel();
        self.topics.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Counting {
        seen: AtomicU64,
    }

    #[async_trait]
    impl BusHandler for Counting {
        async fn handle(&self, _msg: BusMessage) -> Result<(), BusError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn envelope() -> Envelope {
        Envelope::new("call-1", "acme", &serde_json::json!({"n": 1})).unwrap()
    }

    #[tokio::test]
    async fn delivers_once_per_group() {
        let bus = MemoryBus::new();
        let a = Arc::new(Counting {
            seen: AtomicU64::new(0),
        });
        let b = Arc::new(Counting {
            seen: AtomicU64::new(0),
        });

        bus.subscribe("t", "asr", a.clone()).await.unwrap();
        bus.subscribe("t", "fanout", b.clone()).await.unwrap();

        bus.publish("t", envelope()).await.unwrap();

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn round_robins_within_a_group() {
        let bus = MemoryBus::new();
        let a = Arc::new(Counting {
            seen: AtomicU64::new(0),
        });
        let b = Arc::new(Counting {
            seen: AtomicU64::new(0),
        });

        bus.subscribe("t", "asr", a.clone()).await.unwrap();
        bus.subscribe("t", "asr", b.clone()).await.unwrap();

        for _ in 0..4 {
            bus.publish("t", envelope()).await.unwrap();
        }

        // Each group member sees half the messages, group total is exact.
        assert_eq!(
            a.seen.load(Ordering::SeqCst) + b.seen.load(Ordering::SeqCst),
            4
        );
        assert_eq!(a.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_subscription_stops_delivery() {
        let bus = MemoryBus::new();
        let a = Arc::new(Counting {
            seen: AtomicU64::new(0),
        });

        let handle = bus.subscribe("t", "asr", a.clone()).await.unwrap();
        bus.publish("t", envelope()).await.unwrap();
        handle.close().await;
        bus.publish("t", envelope()).await.unwrap();

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let bus = MemoryBus::new();
        bus.close().await;
        assert!(matches!(
            bus.publish("t", envelope()).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = MemoryBus::new();
        let id = bus.publish("empty", envelope()).await.unwrap();
        assert!(!id.is_empty());
    }
}
