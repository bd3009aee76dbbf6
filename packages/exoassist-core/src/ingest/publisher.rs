//! Publish-with-fallback for audio frames.
//!
//! Frames normally go straight to the bus. During an outage they are held
//! in a bounded in-memory buffer sized by wall-clock duration: once the
//! oldest frame exceeds the window it is dropped (counted as a buffer
//! drop). When publishing recovers, the buffer drains oldest-first so
//! frame order on the bus is preserved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::bus::{Envelope, MessageBus};
use crate::metrics::IngestMetrics;
use crate::types::AudioFrame;

struct BufferedFrame {
    frame: AudioFrame,
    buffered_at: Instant,
}

/// Outcome of one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Went to the bus (directly or after draining the backlog).
    Published,
    /// Held in the fallback buffer; the bus is still unreachable.
    Buffered,
}

/// Per-connection publisher with a bounded wall-clock fallback buffer.
pub struct FallbackPublisher {
    bus: Arc<dyn MessageBus>,
    topic: String,
    buffer: Mutex<VecDeque<BufferedFrame>>,
    max_age: Duration,
    metrics: Arc<IngestMetrics>,
    /// Lifetime drops for this connection, for the close threshold.
    total_drops: AtomicU64,
}

impl FallbackPublisher {
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topic: String,
        max_age: Duration,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            bus,
            topic,
            buffer: Mutex::new(VecDeque::new()),
            max_age,
            metrics,
            total_drops: AtomicU64::new(0),
        }
    }

    /// Publishes one frame, falling back to the bounded buffer on failure.
    pub async fn publish(&self, frame: AudioFrame) -> PublishOutcome {
        // Preserve order: while a backlog exists every new frame goes
        // behind it, then we try to drain.
        if !self.buffer.lock().is_empty() {
            self.enqueue(frame);
            self.drain().await;
            return if self.buffer.lock().is_empty() {
                PublishOutcome::Published
            } else {
                PublishOutcome::Buffered
            };
        }

        match self.try_publish(&frame).await {
            Ok(()) => PublishOutcome::Published,
            Err(()) => {
                self.enqueue(frame);
                PublishOutcome::Buffered
            }
        }
    }

    /// Lifetime buffer drops for this connection.
    #[must_use]
    pub fn total_drops(&self) -> u64 {
        self.total_drops.load(Ordering::Relaxed)
    }

    /// Current backlog depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.buffer.lock().len()
    }

    async fn try_publish(&self, frame: &AudioFrame) -> Result<(), ()> {
        let envelope = match Envelope::new(&frame.interaction_id, &frame.tenant_id, frame) {
            Ok(env) => env.with_trace(frame.trace_id.clone()),
            Err(e) => {
                log::warn!("[Ingest] Frame encode failed: {e}");
                return Err(());
            }
        };
        match self.bus.publish(&self.topic, envelope).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("[Ingest] Publish failed on {}: {}", self.topic, e);
                Err(())
            }
        }
    }

    fn enqueue(&self, frame: AudioFrame) {
        let mut buffer = self.buffer.lock();
        self.evict_expired(&mut buffer);
        buffer.push_back(BufferedFrame {
            frame,
            buffered_at: Instant::now(),
        });
        self.metrics.buffer_depth.store(buffer.len() as i64, Ordering::Relaxed);
    }

    fn evict_expired(&self, buffer: &mut VecDeque<BufferedFrame>) {
        let now = Instant::now();
        while let Some(oldest) = buffer.front() {
            if now.duration_since(oldest.buffered_at) <= self.max_age {
                break;
            }
            buffer.pop_front();
            self.metrics.buffer_drops.fetch_add(1, Ordering::Relaxed);
            self.total_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drains the backlog oldest-first, stopping at the first failure.
    async fn drain(&self) {
        loop {
            let next = {
                let mut buffer = self.buffer.lock();
                self.evict_expired(&mut buffer);
                match buffer.front() {
                    Some(front) => front.frame.clone(),
                    None => {
                        self.metrics.buffer_depth.store(0, Ordering::Relaxed);
                        return;
                    }
                }
            };

            if self.try_publish(&next).await.is_err() {
                return;
            }

            let mut buffer = self.buffer.lock();
            buffer.pop_front();
            self.metrics.buffer_depth.store(buffer.len() as i64, Ordering::Relaxed);
        }
    }
}
