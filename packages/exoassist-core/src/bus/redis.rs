//! Redis Streams bus backing.
//!
//! Append-only log per topic with consumer groups for at-least-once
//! delivery:
//!
//! - `publish` is an `XADD` carrying the JSON envelope in one field
//! - `subscribe` creates the group (`XGROUP CREATE ... MKSTREAM`) and runs a
//!   blocking `XREADGROUP` loop; explicit `XACK` after a successful handler
//! - a handler error leaves the entry on the pending list; the loop
//!   periodically re-reads its own pending entries so failed messages are
//!   redelivered
//!
//! Per-topic ordering follows stream order. `close()` cancels every
//! subscription loop and waits for in-flight handlers to drain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::{BusError, BusHandler, BusMessage, Envelope, MessageBus, SubscriptionHandle};

/// Stream entry field that carries the JSON envelope.
const PAYLOAD_FIELD: &str = "payload";

/// Max entries fetched per XREADGROUP call.
const READ_COUNT: usize = 16;

/// XREADGROUP block timeout (ms). Bounds shutdown latency.
const BLOCK_MS: usize = 1000;

/// How often the loop re-reads its own pending entries (failed handlers).
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Redis Streams backing with consumer groups.
pub struct RedisStreamsBus {
    manager: ConnectionManager,
    /// Per-process consumer name within each group.
    consumer_name: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RedisStreamsBus {
    /// Connects to Redis and verifies the connection with a PING.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        let mut manager = ConnectionManager::new(client)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<()>(&mut manager)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self {
            manager,
            consumer_name: format!("exo-{}", Uuid::new_v4()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Creates the consumer group, tolerating one that already exists.
    async fn ensure_group(
        conn: &mut ConnectionManager,
        topic: &str,
        group: &str,
    ) -> Result<(), BusError> {
        let result: Result<(), _> = conn.xgroup_create_mkstream(topic, group, "$").await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::Connection(e.to_string())),
        }
    }

    /// Processes one batch of entries, acking successes.
    async fn dispatch_batch(
        conn: &mut ConnectionManager,
        topic: &str,
        group: &str,
        handler: &Arc<dyn BusHandler>,
        reply: StreamReadReply,
    ) {
        for key in reply.keys {
            for entry in key.ids {
                let Some(raw) = entry.map.get(PAYLOAD_FIELD) else {
                    log::warn!("[RedisBus] Entry {} on {} has no payload field", entry.id, topic);
                    let _: Result<u64, _> = conn.xack(topic, group, &[&entry.id]).await;
                    continue;
                };
                let payload: String = match redis::from_redis_value(raw) {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("[RedisBus] Undecodable entry {} on {}: {}", entry.id, topic, e);
                        let _: Result<u64, _> = conn.xack(topic, group, &[&entry.id]).await;
                        continue;
                    }
                };
                let envelope: Envelope = match serde_json::from_str(&payload) {
                    Ok(env) => env,
                    Err(e) => {
                        // Poison entry: ack it away rather than redelivering forever.
                        log::warn!("[RedisBus] Bad envelope {} on {}: {}", entry.id, topic, e);
                        let _: Result<u64, _> = conn.xack(topic, group, &[&entry.id]).await;
                        continue;
                    }
                };

                let msg = BusMessage {
                    id: entry.id.clone(),
                    topic: topic.to_string(),
                    envelope,
                };

                match handler.handle(msg).await {
                    Ok(()) => {
                        if let Err(e) = conn.xack::<_, _, _, u64>(topic, group, &[&entry.id]).await
                        {
                            log::warn!("[RedisBus] XACK failed for {} on {}: {}", entry.id, topic, e);
                        }
                    }
                    Err(e) => {
                        // Not acked: stays on the pending list for redelivery.
                        log::warn!(
                            "[RedisBus] Handler failed for {} on {}, leaving pending: {}",
                            entry.id,
                            topic,
                            e
                        );
                    }
                }
            }
        }
    }

    /// The delivery loop for one subscription.
    async fn run_subscription(
        conn: ConnectionManager,
        topic: String,
        group: String,
        consumer: String,
        handler: Arc<dyn BusHandler>,
        cancel: CancellationToken,
    ) {
        // Separate handles: `read_conn` sits inside the blocking XREADGROUP
        // future while `ack_conn` serves dispatch/ack traffic.
        let mut read_conn = conn.clone();
        let mut ack_conn = conn;

        let live_opts = StreamReadOptions::default()
            .group(&group, &consumer)
            .count(READ_COUNT)
            .block(BLOCK_MS);
        let pending_opts = StreamReadOptions::default()
            .group(&group, &consumer)
            .count(READ_COUNT);

        let mut last_pending_sweep = tokio::time::Instant::now();

        loop {
            // Periodically re-read our own pending entries so messages whose
            // handler failed get another attempt.
            if last_pending_sweep.elapsed() >= PENDING_SWEEP_INTERVAL {
                last_pending_sweep = tokio::time::Instant::now();
                let pending: Result<StreamReadReply, _> = read_conn
                    .xread_options(&[topic.as_str()], &["0"], &pending_opts)
                    .await;
                if let Ok(reply) = pending {
                    Self::dispatch_batch(&mut ack_conn, &topic, &group, &handler, reply).await;
                }
            }

            let topics = [topic.as_str()];
            let live_keys = [">"];
            let read = read_conn.xread_options::<_, _, StreamReadReply>(
                &topics,
                &live_keys,
                &live_opts,
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                reply = read => match reply {
                    Ok(reply) => {
                        Self::dispatch_batch(&mut ack_conn, &topic, &group, &handler, reply).await;
                    }
                    Err(e) => {
                        log::warn!("[RedisBus] XREADGROUP failed on {}: {}", topic, e);
                        // Back off so a dead Redis doesn't spin the loop.
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }

        log::debug!("[RedisBus] Subscription loop ended: {} ({})", topic, group);
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<String, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let payload =
            serde_json::to_string(&envelope).map_err(|e| BusError::Publish(e.to_string()))?;
        let mut conn = self.manager.clone();
        let id: String = conn
            .xadd(topic, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(id)
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

        let mut conn = self.manager.clone();
        Self::ensure_group(&mut conn, topic, group).await?;

        let cancel = self.cancel.child_token();
        let task = self.tracker.spawn(Self::run_subscription(
            self.manager.clone(),
            topic.to_string(),
            group.to_string(),
            self.consumer_name.clone(),
            handler,
            cancel.clone(),
        ));

        log::info!(
            "[RedisBus] Subscribed {} as {}/{}",
            topic,
            group,
            self.consumer_name
        );
        Ok(SubscriptionHandle::new(cancel, Some(task)))
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("[RedisBus] Closed");
    }
}
