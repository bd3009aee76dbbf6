//! Per-component counters exposed through the health endpoint.
//!
//! Counters are plain atomics updated on the hot paths; `snapshot()`
//! produces the JSON served by `/health`. Latency percentiles come from a
//! small bounded reservoir rather than a full histogram - the dashboard
//! only needs p50/p95 at a glance.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::json;

// ─────────────────────────────────────────────────────────────────────────────
// Latency Reservoir
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded sample reservoir for latency percentiles.
///
/// Keeps the most recent `capacity` samples; percentile queries sort a copy.
pub struct LatencyReservoir {
    samples: Mutex<Vec<u64>>,
    capacity: usize,
    next: AtomicU64,
}

impl LatencyReservoir {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            next: AtomicU64::new(0),
        }
    }

    /// Records one latency sample in milliseconds.
    pub fn record(&self, millis: u64) {
        let mut samples = self.samples.lock();
        if samples.len() < self.capacity {
            samples.push(millis);
        } else {
            // Ring replacement keeps the reservoir biased to recent samples.
            let slot = (self.next.fetch_add(1, Ordering::Relaxed) as usize) % self.capacity;
            samples[slot] = millis;
        }
    }

    /// Returns the given percentile (0-100), or `None` when empty.
    #[must_use]
    pub fn percentile(&self, pct: f64) -> Option<u64> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }
}

impl Default for LatencyReservoir {
    fn default() -> Self {
        Self::new(512)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingest Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Counters for the telephony ingest.
#[derive(Default)]
pub struct IngestMetrics {
    pub frames_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub buffer_drops: AtomicU64,
    pub publish_failures: AtomicU64,
    /// Current fallback-buffer depth across connections (gauge).
    pub buffer_depth: AtomicI64,
    pub active_connections: AtomicI64,
    pub protocol_errors: AtomicU64,
}

impl IngestMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "framesIn": self.frames_in.load(Ordering::Relaxed),
            "bytesIn": self.bytes_in.load(Ordering::Relaxed),
            "bufferDrops": self.buffer_drops.load(Ordering::Relaxed),
            "publishFailures": self.publish_failures.load(Ordering::Relaxed),
            "bufferDepth": self.buffer_depth.load(Ordering::Relaxed),
            "activeConnections": self.active_connections.load(Ordering::Relaxed),
            "protocolErrors": self.protocol_errors.load(Ordering::Relaxed),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ASR Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Counters for the ASR worker.
pub struct AsrMetrics {
    pub connections_created: AtomicU64,
    pub connections_reused: AtomicU64,
    pub duplicate_connection_attempts: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub transcripts_received: AtomicU64,
    pub empty_transcripts: AtomicU64,
    pub silence_skipped: AtomicU64,
    pub idle_closes: AtomicU64,
    pub publish_drops: AtomicU64,
    /// Time from first chunk sent to first partial received, per interaction.
    pub first_partial_latency: LatencyReservoir,
    latency_sum_ms: AtomicU64,
    latency_count: AtomicU64,
}

impl Default for AsrMetrics {
    fn default() -> Self {
        Self {
            connections_created: AtomicU64::new(0),
            connections_reused: AtomicU64::new(0),
            duplicate_connection_attempts: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            transcripts_received: AtomicU64::new(0),
            empty_transcripts: AtomicU64::new(0),
            silence_skipped: AtomicU64::new(0),
            idle_closes: AtomicU64::new(0),
            publish_drops: AtomicU64::new(0),
            first_partial_latency: LatencyReservoir::default(),
            latency_sum_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }
}

impl AsrMetrics {
    /// Records a transcript round-trip latency sample.
    pub fn record_latency(&self, millis: u64) {
        self.latency_sum_ms.fetch_add(millis, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    fn average_latency_ms(&self) -> u64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            self.latency_sum_ms.load(Ordering::Relaxed) / count
        }
    }

    fn empty_transcript_rate(&self) -> f64 {
        let total = self.transcripts_received.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.empty_transcripts.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "connectionsCreated": self.connections_created.load(Ordering::Relaxed),
            "connectionsReused": self.connections_reused.load(Ordering::Relaxed),
            "duplicateConnectionAttempts": self.duplicate_connection_attempts.load(Ordering::Relaxed),
            "chunksSent": self.chunks_sent.load(Ordering::Relaxed),
            "transcriptsReceived": self.transcripts_received.load(Ordering::Relaxed),
            "emptyTranscriptRate": self.empty_transcript_rate(),
            "silenceSkipped": self.silence_skipped.load(Ordering::Relaxed),
            "idleCloses": self.idle_closes.load(Ordering::Relaxed),
            "publishDrops": self.publish_drops.load(Ordering::Relaxed),
            "firstPartialLatencyMs": {
                "p50": self.first_partial_latency.percentile(50.0),
                "p95": self.first_partial_latency.percentile(95.0),
            },
            "averageLatencyMs": self.average_latency_ms(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Consumer Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Counters for the transcript consumer and fan-out.
#[derive(Default)]
pub struct ConsumerMetrics {
    pub transcripts_consumed: AtomicU64,
    pub intents_classified: AtomicU64,
    pub intent_failures: AtomicU64,
    pub kb_lookups: AtomicU64,
    pub kb_failures: AtomicU64,
    pub store_failures: AtomicU64,
    pub events_broadcast: AtomicU64,
    pub sse_clients: AtomicI64,
    pub summary_fallbacks: AtomicU64,
}

impl ConsumerMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "transcriptsConsumed": self.transcripts_consumed.load(Ordering::Relaxed),
            "intentsClassified": self.intents_classified.load(Ordering::Relaxed),
            "intentFailures": self.intent_failures.load(Ordering::Relaxed),
            "kbLookups": self.kb_lookups.load(Ordering::Relaxed),
            "kbFailures": self.kb_failures.load(Ordering::Relaxed),
            "storeFailures": self.store_failures.load(Ordering::Relaxed),
            "eventsBroadcast": self.events_broadcast.load(Ordering::Relaxed),
            "sseClients": self.sse_clients.load(Ordering::Relaxed),
            "summaryFallbacks": self.summary_fallbacks.load(Ordering::Relaxed),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub
// ─────────────────────────────────────────────────────────────────────────────

/// All component metrics, shared across services and the health endpoint.
///
/// Components are individually reference-counted so a service can hold just
/// its own counters (e.g. the per-connection fallback publisher).
#[derive(Default)]
pub struct MetricsHub {
    pub ingest: std::sync::Arc<IngestMetrics>,
    pub asr: std::sync::Arc<AsrMetrics>,
    pub consumer: std::sync::Arc<ConsumerMetrics>,
}

impl MetricsHub {
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "ingest": self.ingest.snapshot(),
            "asr": self.asr.snapshot(),
            "consumer": self.consumer.snapshot(),
        })
    }
}
