//! ASR worker: audio frames in, transcripts out.
//!
//! Subscribes to the audio topic(s), maintains one [`InteractionState`] and
//! at most one STT session per interaction, applies the buffering policy
//! and early-audio filter, and republishes transcripts to
//! `transcript.{interaction_id}` with a bounded retry. Audio flow is never
//! blocked by transcript publishing - transcripts are best-effort.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::SttConnectionMap;
use super::interaction::InteractionState;
use crate::bus::{topics, BusError, BusHandler, BusMessage, Envelope, MessageBus, SubscriptionHandle};
use crate::config::AsrConfig;
use crate::ingest::CallEnd;
use crate::metrics::MetricsHub;
use crate::stt::{SttEvent, SttOpenRequest, SttProvider, SttSession};
use crate::types::{is_supported_sample_rate, AudioFrame, Speaker, Transcript};
use crate::utils::pcm16_energy;

/// Consumer group used on audio topics.
const AUDIO_GROUP: &str = "asr";

/// Streaming ASR worker.
pub struct AsrWorker {
    bus: Arc<dyn MessageBus>,
    provider: Arc<dyn SttProvider>,
    config: AsrConfig,
    metrics: Arc<MetricsHub>,
    interactions: DashMap<String, Arc<InteractionState>>,
    connections: SttConnectionMap,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl AsrWorker {
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        provider: Arc<dyn SttProvider>,
        config: AsrConfig,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self {
            bus,
            provider,
            config,
            metrics,
            interactions: DashMap::new(),
            connections: SttConnectionMap::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Subscribes to the given audio topics plus `call_end`, and starts the
    /// idle reaper.
    pub async fn start(
        self: &Arc<Self>,
        audio_topics: &[String],
    ) -> Result<Vec<SubscriptionHandle>, BusError> {
        let mut handles = Vec::with_capacity(audio_topics.len() + 1);
        for topic in audio_topics {
            let handler = Arc::new(AudioFrameHandler {
                worker: Arc::clone(self),
            });
            handles.push(self.bus.subscribe(topic, AUDIO_GROUP, handler).await?);
        }

        let end_handler = Arc::new(CallEndHandler {
            worker: Arc::clone(self),
        });
        handles.push(
            self.bus
                .subscribe(topics::CALL_END, AUDIO_GROUP, end_handler)
                .await?,
        );

        let worker = Arc::clone(self);
        self.tracker.spawn(async move {
            worker.run_idle_reaper().await;
        });

        log::info!("[ASR] Worker started on {} audio topic(s)", audio_topics.len());
        Ok(handles)
    }

    /// Stops background tasks and closes every live session.
    ///
    /// Sessions are closed before waiting on the tracker: event pumps only
    /// end once their provider session drops the event channel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let ids: Vec<String> = self.interactions.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.close_interaction(&id, "shutdown").await;
        }

        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Number of live interactions (test/debug accessor).
    #[must_use]
    pub fn interaction_count(&self) -> usize {
        self.interactions.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame Path
    // ─────────────────────────────────────────────────────────────────────

    /// Entry point for one audio frame. Safe under concurrent calls for the
    /// same interaction.
    pub async fn handle_frame(self: &Arc<Self>, frame: AudioFrame) {
        if !is_supported_sample_rate(frame.sample_rate) {
            log::warn!(
                "[ASR] {} frame with unsupported rate {}, dropping",
                frame.interaction_id,
                frame.sample_rate
            );
            return;
        }

        let state = match self.state_for(&frame) {
            Ok(state) => state,
            Err(()) => {
                // Mid-stream sample-rate change: fatal for this interaction only.
                self.close_interaction(&frame.interaction_id, "sample-rate mismatch")
                    .await;
                return;
            }
        };

        if state.in_cooldown(&self.config) {
            log::debug!(
                "[ASR] {} in reconnect cool-down, dropping frame {}",
                frame.interaction_id,
                frame.seq
            );
            return;
        }

        // Connection first: an open failure drops this frame and lets the
        // next one retry after the cool-down.
        let session = match self.ensure_session(&state).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("[ASR] {} STT open failed: {}", frame.interaction_id, e);
                state.record_open_error();
                return;
            }
        };

        state.append_frame(&frame.audio);
        self.flush_if_due(&state, &session).await;
    }

    /// Looks up or creates the interaction state, enforcing the fixed
    /// sample rate.
    fn state_for(&self, frame: &AudioFrame) -> Result<Arc<InteractionState>, ()> {
        let entry = self
            .interactions
            .entry(frame.interaction_id.clone())
            .or_insert_with(|| {
                log::info!(
                    "[ASR] New interaction {} (tenant {}, {} Hz)",
                    frame.interaction_id,
                    frame.tenant_id,
                    frame.sample_rate
                );
                Arc::new(InteractionState::new(
                    &frame.interaction_id,
                    &frame.tenant_id,
                    frame.sample_rate,
                    self.config.early_audio_filter,
                ))
            });

        if entry.sample_rate != frame.sample_rate {
            log::warn!(
                "[ASR] {} sample rate changed {} -> {} mid-stream",
                frame.interaction_id,
                entry.sample_rate,
                frame.sample_rate
            );
            return Err(());
        }
        Ok(Arc::clone(&entry))
    }

    /// Gets the interaction's session, creating it exactly once across
    /// concurrent frames.
    async fn ensure_session(
        self: &Arc<Self>,
        state: &Arc<InteractionState>,
    ) -> Result<Arc<SttSession>, crate::stt::SttError> {
        let worker = Arc::clone(self);
        let state_for_factory = Arc::clone(state);
        self.connections
            .get_or_connect(&state.interaction_id, &self.metrics.asr, move || {
                worker.open_session(state_for_factory)
            })
            .await
    }

    /// The connection factory: counts creation, opens the provider session
    /// and wires its event pump.
    fn open_session(
        self: Arc<Self>,
        state: Arc<InteractionState>,
    ) -> BoxFuture<'static, Result<Arc<SttSession>, crate::stt::SttError>> {
        async move {
            self.metrics
                .asr
                .connections_created
                .fetch_add(1, Ordering::Relaxed);

            let (event_tx, event_rx) = mpsc::channel(
                crate::protocol_constants::STT_EVENT_CHANNEL_CAPACITY,
            );

            let session = self
                .provider
                .open(SttOpenRequest {
                    interaction_id: state.interaction_id.clone(),
                    sample_rate: state.sample_rate,
                    events: event_tx,
                })
                .await?;

            let worker = Arc::clone(&self);
            let pump_state = Arc::clone(&state);
            let pump_session = Arc::clone(&session);
            self.tracker.spawn(async move {
                worker.run_event_pump(pump_state, pump_session, event_rx).await;
            });

            Ok(session)
        }
        .boxed()
    }

    /// Drains and sends a chunk when the buffering policy says so.
    async fn flush_if_due(&self, state: &Arc<InteractionState>, session: &Arc<SttSession>) {
        // Order matters: the send lock is taken before draining so two
        // concurrent flushes cannot swap their chunks on the socket.
        let _send_guard = state.lock_send().await;
        let Some(chunk) = state.take_due_chunk(&self.config) else {
            return;
        };

        let energy = pcm16_energy(&chunk);
        log::debug!(
            "[ASR] {} chunk {}B rms={:.1} peak={}",
            state.interaction_id,
            chunk.len(),
            energy.rms,
            energy.peak
        );

        if energy.rms < self.config.silence_rms_threshold {
            self.metrics
                .asr
                .silence_skipped
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        match session.send_audio(chunk).await {
            Ok(()) => {
                self.metrics.asr.chunks_sent.fetch_add(1, Ordering::Relaxed);
                state.record_chunk_sent();
            }
            Err(e) => {
                log::warn!("[ASR] {} send failed: {}", state.interaction_id, e);
                // Drop the dead handle so the next frame reconnects. Only
                // this exact session - a replacement may already exist.
                self.connections
                    .remove_matching(&state.interaction_id, session);
                session.close().await;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transcript Path
    // ─────────────────────────────────────────────────────────────────────

    /// Consumes provider events for one session.
    async fn run_event_pump(
        self: Arc<Self>,
        state: Arc<InteractionState>,
        session: Arc<SttSession>,
        mut events: mpsc::Receiver<SttEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SttEvent::Transcript {
                    text,
                    kind,
                    speaker,
                    confidence,
                } => {
                    self.publish_transcript(&state, &text, kind, speaker, confidence)
                        .await;
                }
                SttEvent::Closed { reason } => {
                    log::info!("[ASR] {} provider closed: {}", state.interaction_id, reason);
                    session.mark_closed();
                    self.connections
                        .remove_matching(&state.interaction_id, &session);
                    break;
                }
            }
        }
    }

    /// Normalises, filters, stamps and publishes one transcript.
    async fn publish_transcript(
        &self,
        state: &Arc<InteractionState>,
        text: &str,
        kind: crate::types::TranscriptKind,
        speaker: Option<String>,
        confidence: Option<f32>,
    ) {
        let metrics = &self.metrics.asr;
        metrics.transcripts_received.fetch_add(1, Ordering::Relaxed);

        let text = text.trim();
        if text.is_empty() {
            metrics.empty_transcripts.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(latency) = state.take_first_partial_latency() {
            metrics.first_partial_latency.record(latency);
        }
        metrics.record_latency(state.ms_since_last_send());

        if !state.should_publish(text, &self.config) {
            log::debug!(
                "[ASR] {} early-audio filter suppressed: {:?}",
                state.interaction_id,
                text
            );
            return;
        }

        let transcript = Transcript {
            interaction_id: state.interaction_id.clone(),
            seq: state.next_seq(),
            ts: crate::utils::now_millis(),
            text: text.to_string(),
            kind,
            speaker: Speaker::parse(speaker.as_deref()),
            confidence,
        };

        let topic = topics::transcript(&state.interaction_id);
        let envelope =
            match Envelope::new(&state.interaction_id, &state.tenant_id, &transcript) {
                Ok(env) => env,
                Err(e) => {
                    log::warn!("[ASR] {} transcript encode failed: {}", state.interaction_id, e);
                    return;
                }
            };

        // Bounded retry with linear backoff; audio keeps flowing regardless.
        for attempt in 1..=self.config.publish_retries {
            match self.bus.publish(&topic, envelope.clone()).await {
                Ok(_) => return,
                Err(e) if attempt == self.config.publish_retries => {
                    log::warn!(
                        "[ASR] {} transcript {} dropped after {} attempts: {}",
                        state.interaction_id,
                        transcript.seq,
                        attempt,
                        e
                    );
                    metrics.publish_drops.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Periodically destroys interactions that stopped receiving frames.
    async fn run_idle_reaper(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let idle_after = Duration::from_secs(self.config.idle_close_s);
            let idle: Vec<String> = self
                .interactions
                .iter()
                .filter(|r| r.value().idle_for() >= idle_after)
                .map(|r| r.key().clone())
                .collect();

            for id in idle {
                self.metrics.asr.idle_closes.fetch_add(1, Ordering::Relaxed);
                self.close_interaction(&id, "idle").await;
            }
        }
    }

    /// Tears down one interaction: session closed, state removed.
    pub async fn close_interaction(&self, interaction_id: &str, reason: &str) {
        if self.interactions.remove(interaction_id).is_some() {
            log::info!("[ASR] Closing interaction {} ({})", interaction_id, reason);
        }
        if let Some(session) = self.connections.remove(interaction_id) {
            session.close().await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus Handlers
// ─────────────────────────────────────────────────────────────────────────────

struct AudioFrameHandler {
    worker: Arc<AsrWorker>,
}

#[async_trait]
impl BusHandler for AudioFrameHandler {
    async fn handle(&self, msg: BusMessage) -> Result<(), BusError> {
        let frame: AudioFrame = msg.envelope.decode()?;
        self.worker.handle_frame(frame).await;
        Ok(())
    }
}

struct CallEndHandler {
    worker: Arc<AsrWorker>,
}

#[async_trait]
impl BusHandler for CallEndHandler {
    async fn handle(&self, msg: BusMessage) -> Result<(), BusError> {
        let end: CallEnd = msg.envelope.decode()?;
        self.worker
            .close_interaction(&end.interaction_id, "call ended")
            .await;
        Ok(())
    }
}
