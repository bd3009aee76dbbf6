//! Transcript consumer and enrichment pipeline.
//!
//! Bridges the internal pub/sub world to the browser world. For every
//! transcript line: cache, write-through persist, broadcast, classify
//! intent, look up KB articles, broadcast the enrichment. Each step is
//! independently fallible - a failed LLM call still results in a
//! `transcript_line` broadcast.
//!
//! Calls are discovered through the registry (the same auto-discovery the
//! dashboard uses): a periodic poll subscribes to `transcript.{id}` for
//! newly active calls and detaches after call end. Every call gets its own
//! ordered queue and worker task so a slow enrichment on one call never
//! head-of-line-blocks another, while per-call broadcast order is
//! preserved.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::{topics, BusError, BusHandler, BusMessage, MessageBus, SubscriptionHandle};
use crate::config::ConsumerConfig;
use crate::fanout::{AssistEvent, FanoutHub};
use crate::ingest::CallEnd;
use crate::kb::KbRouter;
use crate::metrics::ConsumerMetrics;
use crate::registry::CallRegistry;
use crate::store::{AssistStore, IntentRow, TranscriptRow};
use crate::tenant::TenantConfigService;
use crate::types::Transcript;

pub mod cache;
pub mod intent;

pub use cache::TranscriptCache;
pub use intent::{normalise_intent, IntentClassifier};

/// Consumer group used on transcript and call-end topics.
const FANOUT_GROUP: &str = "fanout";

/// How many active calls one discovery poll considers.
const DISCOVERY_PAGE: usize = 256;

/// One unit of work on a call's ordered queue.
struct TranscriptJob {
    tenant_id: String,
    transcript: Transcript,
}

/// Per-call worker: ordered queue plus the bus subscription feeding it.
struct CallWorker {
    tx: mpsc::Sender<TranscriptJob>,
    subscription: Arc<SubscriptionHandle>,
}

/// The transcript consumer.
pub struct TranscriptConsumer {
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn CallRegistry>,
    store: Arc<dyn AssistStore>,
    pub cache: Arc<TranscriptCache>,
    classifier: Arc<IntentClassifier>,
    kb: Arc<KbRouter>,
    hub: Arc<FanoutHub>,
    tenants: Arc<TenantConfigService>,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
    calls: DashMap<String, CallWorker>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TranscriptConsumer {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn CallRegistry>,
        store: Arc<dyn AssistStore>,
        classifier: Arc<IntentClassifier>,
        kb: Arc<KbRouter>,
        hub: Arc<FanoutHub>,
        tenants: Arc<TenantConfigService>,
        config: ConsumerConfig,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        let cache = Arc::new(TranscriptCache::new(Duration::from_secs(config.cache_ttl_s)));
        Self {
            bus,
            registry,
            store,
            cache,
            classifier,
            kb,
            hub,
            tenants,
            config,
            metrics,
            calls: DashMap::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Subscribes to `call_end` and starts the discovery and sweep loops.
    pub async fn start(self: &Arc<Self>) -> Result<SubscriptionHandle, BusError> {
        let end_handler = Arc::new(CallEndFanoutHandler {
            consumer: Arc::clone(self),
        });
        let handle = self
            .bus
            .subscribe(topics::CALL_END, FANOUT_GROUP, end_handler)
            .await?;

        let consumer = Arc::clone(self);
        self.tracker.spawn(async move {
            consumer.run_discovery_loop().await;
        });

        let consumer = Arc::clone(self);
        self.tracker.spawn(async move {
            consumer.run_cache_sweep().await;
        });

        log::info!("[Consumer] Started");
        Ok(handle)
    }

    /// Stops loops and detaches every call.
    ///
    /// Calls are detached before waiting on the tracker: per-call workers
    /// only end once their queue sender is dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let ids: Vec<String> = self.calls.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.detach(&id).await;
        }

        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Calls currently attached (test/debug accessor).
    #[must_use]
    pub fn attached_calls(&self) -> usize {
        self.calls.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────────────

    async fn run_discovery_loop(self: Arc<Self>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.discovery_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.discover_once().await;
        }
    }

    /// One registry poll: attach new active calls, detach vanished ones.
    pub async fn discover_once(self: &Arc<Self>) {
        let active = match self.registry.list_active(DISCOVERY_PAGE).await {
            Ok(active) => active,
            Err(e) => {
                log::warn!("[Consumer] Registry poll failed: {e}");
                return;
            }
        };

        let active_ids: std::collections::HashSet<&str> = active
            .iter()
            .map(|entry| entry.interaction_id.as_str())
            .collect();

        for entry in &active {
            if !self.calls.contains_key(&entry.interaction_id) {
                self.attach(&entry.interaction_id, &entry.tenant_id).await;
            }
        }

        // Entries that expired out of the registry without a call_end.
        let stale: Vec<String> = self
            .calls
            .iter()
            .filter(|r| !active_ids.contains(r.key().as_str()))
            .map(|r| r.key().clone())
            .collect();
        for id in stale {
            self.detach(&id).await;
        }
    }

    /// Subscribes to one call's transcript topic and starts its worker.
    async fn attach(self: &Arc<Self>, interaction_id: &str, tenant_id: &str) {
        let (tx, mut rx) = mpsc::channel::<TranscriptJob>(
            crate::protocol_constants::CALL_QUEUE_CAPACITY,
        );

        let handler = Arc::new(TranscriptTopicHandler {
            tenant_id: tenant_id.to_string(),
            tx: tx.clone(),
        });
        let subscription = match self
            .bus
            .subscribe(&topics::transcript(interaction_id), FANOUT_GROUP, handler)
            .await
        {
            Ok(subscription) => Arc::new(subscription),
            Err(e) => {
                log::warn!("[Consumer] Subscribe failed for {interaction_id}: {e}");
                return;
            }
        };

        let consumer = Arc::clone(self);
        self.tracker.spawn(async move {
            while let Some(job) = rx.recv().await {
                consumer.process_line(&job.tenant_id, job.transcript).await;
            }
        });

        self.calls
            .insert(interaction_id.to_string(), CallWorker { tx, subscription });
        log::info!("[Consumer] Attached call {interaction_id} (tenant {tenant_id})");
    }

    /// Unsubscribes and ends the call's worker.
    async fn detach(&self, interaction_id: &str) {
        if let Some((_, worker)) = self.calls.remove(interaction_id) {
            worker.subscription.close().await;
            // Dropping the sender ends the worker loop after the queue drains.
            drop(worker.tx);
            log::info!("[Consumer] Detached call {interaction_id}");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Line Processing
    // ─────────────────────────────────────────────────────────────────────

    /// Direct entry for the HTTP ingest-transcript path - same pipeline,
    /// no bus hop.
    pub async fn ingest_direct(self: &Arc<Self>, tenant_id: &str, transcript: Transcript) {
        // Clone the sender out of the map guard before awaiting on it.
        let tx = self
            .calls
            .get(&transcript.interaction_id)
            .map(|worker| worker.tx.clone());
        if let Some(tx) = tx {
            let job = TranscriptJob {
                tenant_id: tenant_id.to_string(),
                transcript,
            };
            match tx.send(job).await {
                Ok(()) => return,
                Err(failed) => {
                    // Worker already gone: fall through and process inline.
                    let job = failed.0;
                    self.process_line(&job.tenant_id, job.transcript).await;
                    return;
                }
            }
        }
        // No worker (call not yet discovered or already ended): process
        // inline so the line is still cached and broadcast.
        self.process_line(tenant_id, transcript).await;
    }

    /// The enrichment chain for one line. Every step is independently
    /// fallible; nothing here blocks a later step.
    async fn process_line(&self, tenant_id: &str, transcript: Transcript) {
        // Empty transcripts are filtered at the boundary and never reach
        // caches, stores or broadcast.
        let trimmed = transcript.text.trim();
        if trimmed.is_empty() {
            return;
        }
        self.metrics
            .transcripts_consumed
            .fetch_add(1, Ordering::Relaxed);

        // 1. Cache (backs the polling fallback).
        self.cache.append(&transcript);

        // 2. Write-through store; failure never blocks the broadcast.
        if let Err(e) = self
            .store
            .save_transcript_line(TranscriptRow {
                call_id: transcript.interaction_id.clone(),
                seq: transcript.seq,
                ts: transcript.ts,
                text: transcript.text.clone(),
                speaker: transcript.speaker,
            })
            .await
        {
            self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[Consumer] Transcript persist failed for {}: {}",
                transcript.interaction_id,
                e
            );
        }

        // 3. Broadcast the line.
        self.hub.broadcast(&AssistEvent::TranscriptLine {
            call_id: transcript.interaction_id.clone(),
            seq: transcript.seq,
            ts: transcript.ts,
            text: transcript.text.clone(),
            speaker: transcript.speaker,
        });

        // 4. Intent classification: only lines long enough to mean
        // something, and never bare fillers.
        if trimmed.chars().count() <= self.config.min_intent_chars
            || crate::asr::interaction::is_filler(trimmed)
        {
            return;
        }

        let settings = self.tenants.settings(tenant_id).await;
        let verdict = self
            .classifier
            .classify(
                &transcript.interaction_id,
                transcript.seq,
                trimmed,
                settings.intent_model.as_deref(),
            )
            .await;

        if verdict.is_known() {
            self.metrics
                .intents_classified
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.intent_failures.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = self
            .store
            .save_intent(IntentRow {
                call_id: verdict.interaction_id.clone(),
                seq: verdict.seq,
                intent: verdict.intent.clone(),
                confidence: verdict.confidence,
            })
            .await
        {
            self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[Consumer] Intent persist failed for {}: {}",
                verdict.interaction_id,
                e
            );
        }

        // 5. KB lookup, only for a usable intent. Adapter errors are
        // already degraded to an empty list by the router.
        let articles = if verdict.is_known() {
            self.metrics.kb_lookups.fetch_add(1, Ordering::Relaxed);
            let query = verdict.intent.replace('_', " ");
            self.kb
                .lookup(tenant_id, &query, Some(trimmed.to_string()))
                .await
        } else {
            Vec::new()
        };

        // 6. Broadcast the enrichment.
        self.hub.broadcast(&AssistEvent::IntentUpdate {
            call_id: verdict.interaction_id.clone(),
            seq: verdict.seq,
            intent: verdict.intent,
            confidence: verdict.confidence,
            articles,
        });
    }

    /// Handles one `call_end`: broadcast, then detach the call worker.
    async fn on_call_end(self: &Arc<Self>, end: CallEnd) {
        self.hub.broadcast(&AssistEvent::CallEnd {
            call_id: end.interaction_id.clone(),
            reason: end.reason.clone(),
        });
        self.detach(&end.interaction_id).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────

    async fn run_cache_sweep(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let swept = self.cache.sweep_expired();
            if swept > 0 {
                log::debug!("[Consumer] Swept {swept} stale cached call(s)");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Feeds one call's ordered queue from its transcript topic.
struct TranscriptTopicHandler {
    tenant_id: String,
    tx: mpsc::Sender<TranscriptJob>,
}

#[async_trait]
impl BusHandler for TranscriptTopicHandler {
    async fn handle(&self, msg: BusMessage) -> Result<(), BusError> {
        let transcript: Transcript = msg.envelope.decode()?;
        // Prefer the envelope's tenant stamp over the attach-time value.
        let tenant_id = if msg.envelope.tenant_id.is_empty() {
            self.tenant_id.clone()
        } else {
            msg.envelope.tenant_id.clone()
        };
        self.tx
            .send(TranscriptJob {
                tenant_id,
                transcript,
            })
            .await
            .map_err(|_| BusError::Handler("call worker gone".into()))
    }
}

struct CallEndFanoutHandler {
    consumer: Arc<TranscriptConsumer>,
}

#[async_trait]
impl BusHandler for CallEndFanoutHandler {
    async fn handle(&self, msg: BusMessage) -> Result<(), BusError> {
        let end: CallEnd = msg.envelope.decode()?;
        self.consumer.on_call_end(end).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bus::memory::MemoryBus;
    use crate::bus::Envelope;
    use crate::config::LlmConfig;
    use crate::fanout::SseFrame;
    use crate::kb::{DatabaseKbAdapter, ServiceKbAdapter};
    use crate::llm::MockLlm;
    use crate::registry::{CallRegistryEntry, MemoryRegistry};
    use crate::store::MemoryStore;
    use crate::tenant::{MemoryConfigSource, TenantConfigService};
    use crate::types::{KbArticle, Speaker, TranscriptKind};

    struct Fixture {
        consumer: Arc<TranscriptConsumer>,
        bus: Arc<MemoryBus>,
        registry: Arc<MemoryRegistry>,
        store: Arc<MemoryStore>,
        hub: Arc<FanoutHub>,
        llm: Arc<MockLlm>,
        kb_db: Arc<DatabaseKbAdapter>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(3600)));
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(ConsumerMetrics::default());
        let hub = Arc::new(FanoutHub::new(Arc::clone(&metrics)));
        let llm = Arc::new(MockLlm::new());
        let tenants = Arc::new(TenantConfigService::new(
            Arc::new(MemoryConfigSource::new()),
            3,
        ));
        let kb_db = Arc::new(DatabaseKbAdapter::new());
        let kb = Arc::new(KbRouter::new(
            Arc::clone(&kb_db),
            Arc::new(ServiceKbAdapter::new(
                reqwest::Client::new(),
                "https://kb.invalid/search",
                None,
            )),
            Arc::clone(&tenants),
            Arc::clone(&metrics),
        ));
        let classifier = Arc::new(IntentClassifier::new(
            llm.clone() as Arc<dyn crate::llm::LlmClient>,
            LlmConfig::default(),
        ));

        let consumer = Arc::new(TranscriptConsumer::new(
            bus.clone(),
            registry.clone(),
            store.clone(),
            classifier,
            kb,
            hub.clone(),
            tenants,
            ConsumerConfig::default(),
            metrics,
        ));

        Fixture {
            consumer,
            bus,
            registry,
            store,
            hub,
            llm,
            kb_db,
        }
    }

    fn transcript(call_id: &str, seq: u64, text: &str) -> Transcript {
        Transcript {
            interaction_id: call_id.into(),
            seq,
            ts: seq * 100,
            text: text.into(),
            kind: TranscriptKind::Final,
            speaker: Speaker::Customer,
            confidence: Some(0.9),
        }
    }

    fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<SseFrame>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let SseFrame::Event { data, .. } = frame {
                out.push(data);
            }
        }
        out
    }

    #[tokio::test]
    async fn intent_kb_broadcast_chain() {
        let fx = fixture();
        fx.llm
            .push_reply(r#"{"intent":"credit_card_block","confidence":0.91}"#);
        fx.kb_db.seed(
            "acme",
            vec![
                KbArticle {
                    id: "a1".into(),
                    title: "Block a credit card".into(),
                    snippet: "Steps to block a card".into(),
                    url: None,
                    tags: vec!["card".into()],
                    source: String::new(),
                    confidence: 0.0,
                },
                KbArticle {
                    id: "a2".into(),
                    title: "Credit card fraud".into(),
                    snippet: "Card blocked after fraud".into(),
                    url: None,
                    tags: vec![],
                    source: String::new(),
                    confidence: 0.0,
                },
            ],
        );

        let (_guard, mut rx) = fx.hub.register(Some("call-3".into()));
        fx.consumer
            .process_line("acme", transcript("call-3", 1, "I need to block my credit card"))
            .await;

        let events = drain_events(&mut rx);
        // connection, transcript_line, intent_update - in order.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["type"], "connection");
        assert_eq!(events[1]["type"], "transcript_line");
        assert_eq!(events[1]["text"], "I need to block my credit card");
        assert_eq!(events[2]["type"], "intent_update");
        assert_eq!(events[2]["intent"], "credit_card_block");
        assert_eq!(events[2]["confidence"].as_f64().unwrap(), 0.91f32 as f64);
        assert_eq!(events[2]["articles"].as_array().unwrap().len(), 2);

        // Write-through rows landed.
        assert_eq!(fx.store.transcript_for_call("call-3").await.unwrap().len(), 1);
        assert_eq!(fx.store.intents_for_call("call-3").len(), 1);
    }

    #[tokio::test]
    async fn llm_failure_still_broadcasts_transcript_and_unknown_intent() {
        let fx = fixture();
        fx.llm.push_error("llm down");

        let (_guard, mut rx) = fx.hub.register(Some("call-1".into()));
        fx.consumer
            .process_line("acme", transcript("call-1", 1, "my internet connection keeps dropping"))
            .await;

        let events = drain_events(&mut rx);
        assert_eq!(events[1]["type"], "transcript_line");
        assert_eq!(events[2]["type"], "intent_update");
        assert_eq!(events[2]["intent"], "unknown");
        assert_eq!(events[2]["confidence"], 0.0);
        assert!(events[2]["articles"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_and_filler_lines_skip_classification() {
        let fx = fixture();
        let (_guard, mut rx) = fx.hub.register(Some("call-1".into()));

        fx.consumer
            .process_line("acme", transcript("call-1", 1, "okay"))
            .await;
        fx.consumer
            .process_line("acme", transcript("call-1", 2, "um"))
            .await;

        let events = drain_events(&mut rx);
        // connection + two transcript lines, no intent updates.
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e["type"] != "intent_update"));
        assert_eq!(
            fx.llm.calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        // Skipped lines persist no intent row.
        assert!(fx.store.intents_for_call("call-1").is_empty());
    }

    #[tokio::test]
    async fn empty_lines_never_reach_cache_store_or_broadcast() {
        let fx = fixture();
        let (_guard, mut rx) = fx.hub.register(None);

        fx.consumer
            .process_line("acme", transcript("call-1", 1, "   "))
            .await;

        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1); // connection only
        assert!(fx.consumer.cache.read("call-1").is_none());
        assert!(fx.store.transcript_for_call("call-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discovery_attaches_active_calls_and_consumes_their_topics() {
        let fx = fixture();
        fx.registry
            .register(CallRegistryEntry::new("call-9", "acme"))
            .await
            .unwrap();

        fx.consumer.discover_once().await;
        assert_eq!(fx.consumer.attached_calls(), 1);

        let (_guard, mut rx) = fx.hub.register(Some("call-9".into()));
        let envelope = Envelope::new(
            "call-9",
            "acme",
            &transcript("call-9", 1, "hello out there"),
        )
        .unwrap();
        fx.bus
            .publish(&topics::transcript("call-9"), envelope)
            .await
            .unwrap();

        // The per-call worker runs on its own task.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| e["type"] == "transcript_line"));
    }

    #[tokio::test]
    async fn call_end_broadcasts_and_detaches() {
        let fx = fixture();
        fx.registry
            .register(CallRegistryEntry::new("call-5", "acme"))
            .await
            .unwrap();
        fx.consumer.discover_once().await;
        assert_eq!(fx.consumer.attached_calls(), 1);

        let (_guard, mut rx) = fx.hub.register(Some("call-5".into()));
        fx.consumer
            .on_call_end(CallEnd {
                interaction_id: "call-5".into(),
                tenant_id: "acme".into(),
                reason: "callended".into(),
            })
            .await;

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| e["type"] == "call_end" && e["reason"] == "callended"));
        assert_eq!(fx.consumer.attached_calls(), 0);
    }
}
