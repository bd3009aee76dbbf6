//! SSE fan-out hub.
//!
//! Bridges the internal pipeline to browser dashboards. Clients register
//! under a `callId` (or the global bucket) and receive events over a
//! per-client channel - one writer per client, so stream writes are
//! serialised by construction. A process-wide heartbeat emits comment
//! frames every 30 seconds while any client is connected and stops with
//! the last one. A client whose channel is gone (or full - a stalled
//! reader) is evicted on the next write.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::ConsumerMetrics;
use crate::protocol_constants::{SSE_CLIENT_CHANNEL_CAPACITY, SSE_HEARTBEAT_SECS};
use crate::types::{KbArticle, Speaker};
use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// Event pushed to dashboard clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistEvent {
    /// Emitted once to each client on connect so its "open" indicator fires.
    Connection {
        #[serde(rename = "callId")]
        call_id: Option<String>,
        message: String,
        timestamp: u64,
    },
    TranscriptLine {
        #[serde(rename = "callId")]
        call_id: String,
        seq: u64,
        ts: u64,
        text: String,
        speaker: Speaker,
    },
    IntentUpdate {
        #[serde(rename = "callId")]
        call_id: String,
        seq: u64,
        intent: String,
        confidence: f32,
        articles: Vec<KbArticle>,
    },
    CallEnd {
        #[serde(rename = "callId")]
        call_id: String,
        reason: String,
    },
}

impl AssistEvent {
    /// SSE `event:` field value.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::TranscriptLine { .. } => "transcript_line",
            Self::IntentUpdate { .. } => "intent_update",
            Self::CallEnd { .. } => "call_end",
        }
    }

    /// The call this event belongs to (None for connection events in the
    /// global bucket).
    #[must_use]
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::Connection { call_id, .. } => call_id.as_deref(),
            Self::TranscriptLine { call_id, .. }
            | Self::IntentUpdate { call_id, .. }
            | Self::CallEnd { call_id, .. } => Some(call_id),
        }
    }
}

/// One frame on a client's wire: an event or a heartbeat comment.
#[derive(Debug, Clone)]
pub enum SseFrame {
    Event {
        name: &'static str,
        data: serde_json::Value,
    },
    Comment(&'static str),
}

impl SseFrame {
    fn from_event(event: &AssistEvent) -> Option<Self> {
        match serde_json::to_value(event) {
            Ok(data) => Some(Self::Event {
                name: event.event_name(),
                data,
            }),
            Err(e) => {
                log::warn!("[Fanout] Event serialize failed: {e}");
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub
// ─────────────────────────────────────────────────────────────────────────────

struct SseClient {
    /// None = global bucket (receives every call's events).
    call_id: Option<String>,
    tx: mpsc::Sender<SseFrame>,
}

/// Registry of connected SSE clients.
pub struct FanoutHub {
    clients: DashMap<String, SseClient>,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
    heartbeat_interval: Duration,
    metrics: Arc<ConsumerMetrics>,
}

impl FanoutHub {
    #[must_use]
    pub fn new(metrics: Arc<ConsumerMetrics>) -> Self {
        Self {
            clients: DashMap::new(),
            heartbeat: Mutex::new(None),
            heartbeat_interval: Duration::from_secs(SSE_HEARTBEAT_SECS),
            metrics,
        }
    }

    /// Registers a client and returns its RAII guard plus frame stream.
    ///
    /// The `connection` event is queued immediately; the heartbeat task is
    /// started if this is the first client.
    pub fn register(
        self: &Arc<Self>,
        call_id: Option<String>,
    ) -> (ClientGuard, mpsc::Receiver<SseFrame>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SSE_CLIENT_CHANNEL_CAPACITY);

        let connection_event = AssistEvent::Connection {
            call_id: call_id.clone(),
            message: "connected".to_string(),
            timestamp: now_millis(),
        };
        if let Some(frame) = SseFrame::from_event(&connection_event) {
            let _ = tx.try_send(frame);
        }

        self.clients.insert(id.clone(), SseClient { call_id, tx });
        self.metrics.sse_clients.fetch_add(1, Ordering::Relaxed);
        self.ensure_heartbeat();

        log::info!(
            "[Fanout] Client registered: {} (total: {})",
            id,
            self.clients.len()
        );

        (
            ClientGuard {
                id,
                hub: Arc::clone(self),
            },
            rx,
        )
    }

    fn unregister(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            self.metrics.sse_clients.fetch_sub(1, Ordering::Relaxed);
            log::info!(
                "[Fanout] Client unregistered: {} (remaining: {})",
                id,
                self.clients.len()
            );
        }
        if self.clients.is_empty() {
            self.stop_heartbeat();
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Delivers an event to the global bucket and to clients watching its
    /// call. Clients whose channel is closed or full are evicted.
    pub fn broadcast(&self, event: &AssistEvent) {
        // Empty transcripts are filtered at every boundary; this is the last.
        if let AssistEvent::TranscriptLine { text, .. } = event {
            if text.trim().is_empty() {
                return;
            }
        }

        let Some(frame) = SseFrame::from_event(event) else {
            return;
        };
        self.metrics.events_broadcast.fetch_add(1, Ordering::Relaxed);

        let mut dead = Vec::new();
        for client in self.clients.iter() {
            let matches = match (&client.call_id, event.call_id()) {
                (None, _) => true,
                (Some(watching), Some(call)) => watching == call,
                (Some(_), None) => false,
            };
            if !matches {
                continue;
            }
            if client.tx.try_send(frame.clone()).is_err() {
                dead.push(client.key().clone());
            }
        }

        for id in dead {
            log::debug!("[Fanout] Evicting unwritable client {id}");
            self.unregister(&id);
        }
    }

    /// Sends the heartbeat comment to every client.
    fn send_heartbeat(&self) {
        let mut dead = Vec::new();
        for client in self.clients.iter() {
            if client.tx.try_send(SseFrame::Comment("heartbeat")).is_err() {
                dead.push(client.key().clone());
            }
        }
        for id in dead {
            self.unregister(&id);
        }
    }

    /// Starts the heartbeat task if not already running for this process.
    fn ensure_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let hub: Weak<FanoutHub> = Arc::downgrade(self);
        let interval = self.heartbeat_interval;
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so heartbeats trail
            // the connection event by a full interval.
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(hub) = hub.upgrade() else { break };
                if hub.clients.is_empty() {
                    break;
                }
                hub.send_heartbeat();
            }
        }));
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
    }
}

impl Drop for FanoutHub {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
    }
}

/// RAII registration guard; dropping it removes the client.
pub struct ClientGuard {
    id: String,
    hub: Arc<FanoutHub>,
}

impl ClientGuard {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Arc<FanoutHub> {
        Arc::new(FanoutHub::new(Arc::new(ConsumerMetrics::default())))
    }

    fn line(call_id: &str, seq: u64, text: &str) -> AssistEvent {
        AssistEvent::TranscriptLine {
            call_id: call_id.to_string(),
            seq,
            ts: seq * 100,
            text: text.to_string(),
            speaker: Speaker::Customer,
        }
    }

    fn next_event(rx: &mut mpsc::Receiver<SseFrame>) -> Option<(String, serde_json::Value)> {
        match rx.try_recv() {
            Ok(SseFrame::Event { name, data }) => Some((name.to_string(), data)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn connection_event_arrives_first() {
        let hub = hub();
        let (_guard, mut rx) = hub.register(Some("call-1".into()));

        let (name, data) = next_event(&mut rx).unwrap();
        assert_eq!(name, "connection");
        assert_eq!(data["type"], "connection");
        assert_eq!(data["callId"], "call-1");
        assert_eq!(data["message"], "connected");
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_and_global_clients() {
        let hub = hub();
        let (_g1, mut watching) = hub.register(Some("call-1".into()));
        let (_g2, mut other) = hub.register(Some("call-2".into()));
        let (_g3, mut global) = hub.register(None);

        // Drain connection events.
        next_event(&mut watching);
        next_event(&mut other);
        next_event(&mut global);

        hub.broadcast(&line("call-1", 1, "hello"));

        let (name, data) = next_event(&mut watching).unwrap();
        assert_eq!(name, "transcript_line");
        assert_eq!(data["text"], "hello");

        assert!(next_event(&mut other).is_none());
        assert!(next_event(&mut global).is_some());
    }

    #[tokio::test]
    async fn empty_transcripts_never_broadcast() {
        let hub = hub();
        let (_guard, mut rx) = hub.register(None);
        next_event(&mut rx);

        hub.broadcast(&line("call-1", 1, "   "));
        assert!(next_event(&mut rx).is_none());
    }

    #[tokio::test]
    async fn dropped_guard_unregisters() {
        let hub = hub();
        let (guard, _rx) = hub.register(None);
        assert_eq!(hub.client_count(), 1);
        drop(guard);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn closed_receiver_is_evicted_on_broadcast() {
        let hub = hub();
        let (_guard, rx) = hub.register(Some("call-1".into()));
        drop(rx);

        hub.broadcast(&line("call-1", 1, "hello"));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_runs_while_clients_exist() {
        let hub = hub();
        let (_guard, mut rx) = hub.register(None);
        next_event(&mut rx);

        tokio::time::advance(Duration::from_secs(SSE_HEARTBEAT_SECS + 1)).await;
        // Let the heartbeat task run (auto-advancing sleep yields to it).
        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::task::yield_now().await;

        let got_comment = matches!(rx.try_recv(), Ok(SseFrame::Comment(_)));
        assert!(got_comment);
    }

    #[tokio::test]
    async fn call_end_serializes_with_reason() {
        let event = AssistEvent::CallEnd {
            call_id: "call-1".into(),
            reason: "callended".into(),
        };
        let data = serde_json::to_value(&event).unwrap();
        assert_eq!(data["type"], "call_end");
        assert_eq!(data["callId"], "call-1");
        assert_eq!(data["reason"], "callended");
    }
}
