//! Telephony WebSocket termination.
//!
//! Speaks the provider's framed JSON protocol (`connected`, `start`,
//! `media`, `stop`), decodes base64 PCM16 payloads, assigns monotonic
//! frame sequence numbers and publishes frames through the fallback
//! publisher. The provider's `call_sid` becomes the `interaction_id` used
//! throughout the system.
//!
//! Protocol errors drop the offending message and count it; only contract
//! violations (sample-rate change mid-stream) or a persistently dead bus
//! close the connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;

use super::connection::IngestConnectionManager;
use super::publisher::FallbackPublisher;
use super::CallEnd;
use crate::bus::{topics, Envelope, MessageBus};
use crate::config::IngestConfig;
use crate::metrics::MetricsHub;
use crate::protocol_constants::{MEDIA_FRAME_MS, MEDIA_FRAME_TOLERANCE, PCM16_ENCODING};
use crate::registry::{CallRegistry, CallRegistryEntry};
use crate::types::{is_supported_sample_rate, AudioFrame};
use crate::utils::pcm16_ms_to_bytes;

// ─────────────────────────────────────────────────────────────────────────────
// Protocol Payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaFormat {
    encoding: String,
    sample_rate: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    stream_sid: String,
    call_sid: String,
    account_sid: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    media_format: MediaFormat,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaPayload {
    /// Provider-side chunk counter, monotonic per stream.
    #[allow(dead_code)]
    chunk: u64,
    timestamp: u64,
    /// Base64-encoded PCM16.
    payload: String,
}

#[derive(Deserialize)]
struct StopPayload {
    #[serde(default)]
    reason: Option<String>,
}

/// What the connection loop should do after one message.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Continue,
    /// Clean close (stop received, watchdog fired, contract violated).
    Close,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// Shared dependencies of every telephony connection.
pub struct IngestService {
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<dyn CallRegistry>,
    pub metrics: Arc<MetricsHub>,
    pub config: IngestConfig,
    /// Deployment choice: one shared audio topic vs per-tenant topics.
    pub shared_audio_topic: bool,
    pub manager: Arc<IngestConnectionManager>,
    /// External verdict provider consulted before upgrade.
    pub auth: Arc<dyn super::auth::IngestAuthPolicy>,
}

impl IngestService {
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn CallRegistry>,
        metrics: Arc<MetricsHub>,
        config: IngestConfig,
        shared_audio_topic: bool,
        manager: Arc<IngestConnectionManager>,
    ) -> Self {
        Self {
            bus,
            registry,
            metrics,
            config,
            shared_audio_topic,
            manager,
            auth: Arc::new(super::auth::AllowAllPolicy),
        }
    }

    /// Replaces the default allow-all policy.
    #[must_use]
    pub fn with_auth_policy(mut self, auth: Arc<dyn super::auth::IngestAuthPolicy>) -> Self {
        self.auth = auth;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-Connection State
// ─────────────────────────────────────────────────────────────────────────────

/// One live call on this connection, created by `start`.
struct CallSession {
    interaction_id: String,
    tenant_id: String,
    sample_rate: u32,
    expected_frame_bytes: usize,
    next_seq: u64,
    publisher: FallbackPublisher,
}

/// Message-level protocol driver, separated from the socket loop so tests
/// can feed it JSON directly.
pub struct IngestConnection {
    service: Arc<IngestService>,
    session: Option<CallSession>,
}

impl IngestConnection {
    #[must_use]
    pub fn new(service: Arc<IngestService>) -> Self {
        Self {
            service,
            session: None,
        }
    }

    /// Whether a `start` has been accepted.
    #[must_use]
    pub fn call_active(&self) -> bool {
        self.session.is_some()
    }

    /// Current interaction id, if a call is active.
    #[must_use]
    pub fn interaction_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.interaction_id.as_str())
    }

    /// Processes one text message from the provider.
    pub async fn on_text(&mut self, text: &str) -> bool {
        self.on_text_inner(text).await == Disposition::Close
    }

    async fn on_text_inner(&mut self, text: &str) -> Disposition {
        let metrics = &self.service.metrics.ingest;

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Ingest] Malformed JSON dropped: {e}");
                return Disposition::Continue;
            }
        };

        match value.get("event").and_then(|v| v.as_str()) {
            Some("connected") => {
                log::debug!("[Ingest] Provider handshake received");
                Disposition::Continue
            }
            Some("start") => match serde_json::from_value(value["start"].clone()) {
                Ok(start) => self.on_start(start).await,
                Err(e) => {
                    metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[Ingest] Bad start payload dropped: {e}");
                    Disposition::Continue
                }
            },
            Some("media") => match serde_json::from_value(value["media"].clone()) {
                Ok(media) => self.on_media(media).await,
                Err(e) => {
                    metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[Ingest] Bad media payload dropped: {e}");
                    Disposition::Continue
                }
            },
            Some("stop") => {
                let stop: StopPayload = serde_json::from_value(value["stop"].clone())
                    .unwrap_or(StopPayload { reason: None });
                self.finish_call(stop.reason.as_deref().unwrap_or("stopped"))
                    .await;
                Disposition::Close
            }
            Some(other) => {
                log::debug!("[Ingest] Ignoring unknown event {other:?}");
                Disposition::Continue
            }
            None => {
                metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Ingest] Message without event field dropped");
                Disposition::Continue
            }
        }
    }

    async fn on_start(&mut self, start: StartPayload) -> Disposition {
        if !is_supported_sample_rate(start.media_format.sample_rate) {
            log::warn!(
                "[Ingest] Unsupported sample rate {} on {}, closing",
                start.media_format.sample_rate,
                start.call_sid
            );
            return Disposition::Close;
        }
        if start.media_format.encoding != PCM16_ENCODING {
            log::warn!(
                "[Ingest] Unsupported encoding {:?} on {}, closing",
                start.media_format.encoding,
                start.call_sid
            );
            return Disposition::Close;
        }

        if let Some(existing) = &self.session {
            // A second start on the same socket with a different format is a
            // contract violation for this call.
            if existing.sample_rate == start.media_format.sample_rate {
                return Disposition::Continue;
            }
            log::warn!(
                "[Ingest] Sample rate changed mid-stream on {}, closing",
                existing.interaction_id
            );
            // Same teardown as `stop`: registry flips to ended and the
            // call_end event still reaches the dashboard.
            self.finish_call("stopped").await;
            return Disposition::Close;
        }

        let sample_rate = start.media_format.sample_rate;
        let topic = topics::audio(self.service.shared_audio_topic, &start.account_sid);
        let publisher = FallbackPublisher::new(
            Arc::clone(&self.service.bus),
            topic,
            Duration::from_millis(self.service.config.max_buffer_ms),
            Arc::clone(&self.service.metrics.ingest),
        );

        let mut entry = CallRegistryEntry::new(&start.call_sid, &start.account_sid);
        entry
            .metadata
            .insert("streamSid".into(), serde_json::json!(start.stream_sid));
        if let Some(from) = &start.from {
            entry.metadata.insert("from".into(), serde_json::json!(from));
        }
        if let Some(to) = &start.to {
            entry.metadata.insert("to".into(), serde_json::json!(to));
        }
        if let Err(e) = self.service.registry.register(entry).await {
            log::warn!(
                "[Ingest] Registry register failed for {}: {}",
                start.call_sid,
                e
            );
        }

        log::info!(
            "[Ingest] Call started: {} (tenant {}, {} Hz)",
            start.call_sid,
            start.account_sid,
            sample_rate
        );

        self.session = Some(CallSession {
            interaction_id: start.call_sid,
            tenant_id: start.account_sid,
            sample_rate,
            expected_frame_bytes: pcm16_ms_to_bytes(MEDIA_FRAME_MS, sample_rate),
            next_seq: 1,
            publisher,
        });
        Disposition::Continue
    }

    async fn on_media(&mut self, media: MediaPayload) -> Disposition {
        let metrics = Arc::clone(&self.service.metrics.ingest);
        let max_drops = self.service.config.max_buffer_drops;

        let (interaction_id, drops) = {
            let Some(session) = &mut self.session else {
                log::debug!("[Ingest] Media before start, dropping");
                return Disposition::Continue;
            };

            let audio = match BASE64.decode(media.payload.as_bytes()) {
                Ok(audio) => audio,
                Err(e) => {
                    metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[Ingest] Base64 decode failed on {}: {}",
                        session.interaction_id,
                        e
                    );
                    return Disposition::Continue;
                }
            };

            // One media event should hold 20 ms at the declared rate, +-10%.
            let expected = session.expected_frame_bytes as f64;
            let deviation = (audio.len() as f64 - expected).abs() / expected;
            if deviation > MEDIA_FRAME_TOLERANCE {
                metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[Ingest] Frame length {}B off expected {}B on {}, dropping",
                    audio.len(),
                    session.expected_frame_bytes,
                    session.interaction_id
                );
                return Disposition::Continue;
            }

            metrics.frames_in.fetch_add(1, Ordering::Relaxed);
            metrics
                .bytes_in
                .fetch_add(audio.len() as u64, Ordering::Relaxed);

            let frame = AudioFrame {
                tenant_id: session.tenant_id.clone(),
                interaction_id: session.interaction_id.clone(),
                seq: session.next_seq,
                timestamp_ms: media.timestamp,
                sample_rate: session.sample_rate,
                encoding: PCM16_ENCODING.to_string(),
                audio: Bytes::from(audio),
                trace_id: None,
            };
            session.next_seq += 1;

            session.publisher.publish(frame).await;
            (
                session.interaction_id.clone(),
                session.publisher.total_drops(),
            )
        };

        if drops >= max_drops {
            log::error!(
                "[Ingest] Bus unreachable, {} drops on {} - closing connection",
                drops,
                interaction_id
            );
            self.finish_call("stopped").await;
            return Disposition::Close;
        }

        if let Err(e) = self.service.registry.touch(&interaction_id).await {
            log::debug!("[Ingest] Registry touch failed: {e}");
        }

        Disposition::Continue
    }

    /// Marks the call ended and publishes the `call_end` event. Idempotent:
    /// the session is consumed.
    pub async fn finish_call(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };

        if let Err(e) = self
            .service
            .registry
            .mark_ended(&session.interaction_id)
            .await
        {
            log::warn!(
                "[Ingest] Registry mark_ended failed for {}: {}",
                session.interaction_id,
                e
            );
        }

        let end = CallEnd {
            interaction_id: session.interaction_id.clone(),
            tenant_id: session.tenant_id.clone(),
            reason: reason.to_string(),
        };
        match Envelope::new(&end.interaction_id, &end.tenant_id, &end) {
            Ok(envelope) => {
                if let Err(e) = self.service.bus.publish(topics::CALL_END, envelope).await {
                    log::warn!(
                        "[Ingest] call_end publish failed for {}: {}",
                        session.interaction_id,
                        e
                    );
                }
            }
            Err(e) => log::warn!("[Ingest] call_end encode failed: {e}"),
        }

        log::info!(
            "[Ingest] Call ended: {} ({})",
            session.interaction_id,
            reason
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Main telephony WebSocket connection handler.
pub async fn handle_telephony_socket(socket: WebSocket, service: Arc<IngestService>) {
    let guard = service
        .manager
        .register(Arc::clone(&service.metrics.ingest));
    let cancel_token = guard.cancel_token().clone();
    let mut connection = IngestConnection::new(Arc::clone(&service));

    let (mut sender, mut receiver) = socket.split();
    let mut last_media = Instant::now();

    // Use interval instead of sleep to reduce timer allocations and prevent
    // drift. Delay mode skips missed ticks rather than bursting to catch up.
    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let idle_after = Duration::from_secs(service.config.idle_close_s);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[Ingest] Connection force-closed: {}", guard.id());
                connection.finish_call("stopped").await;
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text.contains("\"event\":\"media\"") || text.contains("\"media\"") {
                        last_media = Instant::now();
                    }
                    if connection.on_text(&text).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    // Transport gone: synthesize a stop for any active call.
                    connection.finish_call("stopped").await;
                    break;
                }
            },
            _ = watchdog.tick() => {
                if last_media.elapsed() >= idle_after {
                    log::info!(
                        "[Ingest] Idle watchdog fired on {} after {:?}",
                        guard.id(),
                        idle_after
                    );
                    connection.finish_call("stopped").await;
                    break;
                }
            }
        }
    }

    // Normal-status close frame; the peer may already be gone.
    let _ = sender.send(Message::Close(None)).await;

    // ConnectionGuard drop unregisters and updates the gauge.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::registry::{CallStatus, MemoryRegistry};

    fn service() -> (Arc<IngestService>, Arc<MemoryRegistry>, Arc<MetricsHub>) {
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(3600)));
        let metrics = Arc::new(MetricsHub::default());
        let service = Arc::new(IngestService::new(
            Arc::new(MemoryBus::new()),
            registry.clone(),
            metrics.clone(),
            IngestConfig::default(),
            true,
            Arc::new(IngestConnectionManager::new()),
        ));
        (service, registry, metrics)
    }

    fn start_json(call_sid: &str, rate: u32) -> String {
        format!(
            r#"{{"event":"start","start":{{"streamSid":"MZ1","callSid":"{call_sid}","accountSid":"acme","from":"+15550001","to":"+15550002","mediaFormat":{{"encoding":"pcm16","sampleRate":{rate}}}}}}}"#
        )
    }

    fn media_json(payload: &str) -> String {
        format!(
            r#"{{"event":"media","media":{{"chunk":1,"timestamp":20,"payload":"{payload}"}}}}"#
        )
    }

    fn valid_payload() -> String {
        BASE64.encode(vec![0u8; 320])
    }

    #[tokio::test]
    async fn start_registers_the_call() {
        let (service, registry, _metrics) = service();
        let mut conn = IngestConnection::new(service);

        assert!(!conn.on_text(&start_json("call-1", 8000)).await);
        assert!(conn.call_active());

        let entry = registry.get("call-1").await.unwrap().unwrap();
        assert_eq!(entry.tenant_id, "acme");
        assert_eq!(entry.status, CallStatus::Active);
        assert_eq!(entry.metadata["streamSid"], "MZ1");
    }

    #[tokio::test]
    async fn media_counts_frames_and_touches_registry() {
        let (service, _registry, metrics) = service();
        let mut conn = IngestConnection::new(service);

        conn.on_text(&start_json("call-1", 8000)).await;
        assert!(!conn.on_text(&media_json(&valid_payload())).await);

        assert_eq!(metrics.ingest.frames_in.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.ingest.bytes_in.load(Ordering::Relaxed), 320);
    }

    #[tokio::test]
    async fn malformed_json_and_bad_base64_drop_but_do_not_close() {
        let (service, _registry, metrics) = service();
        let mut conn = IngestConnection::new(service);
        conn.on_text(&start_json("call-1", 8000)).await;

        assert!(!conn.on_text("{not json").await);
        assert!(!conn.on_text(&media_json("%%%not-base64%%%")).await);

        assert_eq!(metrics.ingest.protocol_errors.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.ingest.frames_in.load(Ordering::Relaxed), 0);
        assert!(conn.call_active());
    }

    #[tokio::test]
    async fn wrong_length_frame_is_dropped() {
        let (service, _registry, metrics) = service();
        let mut conn = IngestConnection::new(service);
        conn.on_text(&start_json("call-1", 8000)).await;

        // 100 bytes is far off the 320-byte 20 ms frame at 8 kHz.
        let short = BASE64.encode(vec![0u8; 100]);
        assert!(!conn.on_text(&media_json(&short)).await);
        assert_eq!(metrics.ingest.frames_in.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.ingest.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stop_ends_call_and_closes() {
        let (service, registry, _metrics) = service();
        let mut conn = IngestConnection::new(service);
        conn.on_text(&start_json("call-1", 8000)).await;

        let closed = conn
            .on_text(r#"{"event":"stop","stop":{"reason":"callended"}}"#)
            .await;
        assert!(closed);
        assert!(!conn.call_active());

        let entry = registry.get("call-1").await.unwrap().unwrap();
        assert_eq!(entry.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn unknown_event_is_ignored() {
        let (service, _registry, metrics) = service();
        let mut conn = IngestConnection::new(service);
        assert!(!conn.on_text(r#"{"event":"mark","mark":{}}"#).await);
        assert_eq!(metrics.ingest.protocol_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn sample_rate_change_closes_connection_and_ends_call() {
        let (service, registry, _metrics) = service();
        let mut conn = IngestConnection::new(service);
        conn.on_text(&start_json("call-1", 8000)).await;
        assert!(conn.on_text(&start_json("call-1", 16000)).await);

        // The teardown matches the stop path: session consumed, registry
        // entry flipped to ended rather than left to expire by TTL.
        assert!(!conn.call_active());
        let entry = registry.get("call-1").await.unwrap().unwrap();
        assert_eq!(entry.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn unsupported_rate_rejected_at_start() {
        let (service, _registry, _metrics) = service();
        let mut conn = IngestConnection::new(service);
        assert!(conn.on_text(&start_json("call-1", 44100)).await);
        assert!(!conn.call_active());
    }
}
