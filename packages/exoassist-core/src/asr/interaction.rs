//! Per-interaction ASR state.
//!
//! One `InteractionState` exists per active interaction, created on its
//! first frame and destroyed on idle timeout or explicit stop. The audio
//! buffer and its bookkeeping sit behind one mutex; the STT send itself is
//! serialised by a separate async lock so new frames can enqueue while a
//! send is in flight without ever reordering audio.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::config::AsrConfig;
use crate::protocol_constants::FILLER_WORDS;
use crate::utils::pcm16_bytes_to_ms;

/// Buffer and timing state guarded by one mutex.
struct BufferInner {
    buffer: BytesMut,
    /// Whether the warm-up send has happened.
    warmed_up: bool,
    last_frame_at: Instant,
    /// Gap between the two most recent frames (ms).
    last_frame_gap_ms: u64,
    last_send_at: Instant,
}

/// State machine for one interaction.
pub struct InteractionState {
    pub interaction_id: String,
    pub tenant_id: String,
    /// Fixed on the first frame; later frames with a different rate close
    /// the interaction.
    pub sample_rate: u32,
    inner: Mutex<BufferInner>,
    /// Serialises drain+send so chunks reach the provider in order.
    send_lock: tokio::sync::Mutex<()>,
    first_frame_at: Instant,
    /// Set once a non-filler transcript is seen.
    speech_detected: AtomicBool,
    /// Early-audio filter still active for this interaction.
    filter_engaged: AtomicBool,
    next_transcript_seq: AtomicU64,
    /// First successful chunk send, for first-partial latency.
    first_chunk_sent_at: OnceLock<Instant>,
    first_transcript_seen: AtomicBool,
    /// Last failed STT open, for retry cool-down.
    last_error_at: Mutex<Option<Instant>>,
}

impl InteractionState {
    #[must_use]
    pub fn new(
        interaction_id: &str,
        tenant_id: &str,
        sample_rate: u32,
        filter_enabled: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            interaction_id: interaction_id.to_string(),
            tenant_id: tenant_id.to_string(),
            sample_rate,
            inner: Mutex::new(BufferInner {
                buffer: BytesMut::new(),
                warmed_up: false,
                last_frame_at: now,
                last_frame_gap_ms: 0,
                last_send_at: now,
            }),
            send_lock: tokio::sync::Mutex::new(()),
            first_frame_at: now,
            speech_detected: AtomicBool::new(false),
            filter_engaged: AtomicBool::new(filter_enabled),
            next_transcript_seq: AtomicU64::new(1),
            first_chunk_sent_at: OnceLock::new(),
            first_transcript_seen: AtomicBool::new(false),
            last_error_at: Mutex::new(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Buffering
    // ─────────────────────────────────────────────────────────────────────

    /// Appends one frame of audio and records the inter-frame gap.
    pub fn append_frame(&self, audio: &[u8]) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_frame_gap_ms = now.duration_since(inner.last_frame_at).as_millis() as u64;
        inner.last_frame_at = now;
        inner.buffer.extend_from_slice(audio);
    }

    /// Acquires the send lock; hold the returned guard across the drain and
    /// the provider send.
    pub async fn lock_send(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    /// Drains the buffer if any send trigger is due. Call with the send
    /// lock held.
    ///
    /// Warm-up: nothing is sent until at least `warmup_ms` of audio is
    /// buffered. Afterwards a send fires when the last inter-frame gap
    /// reached `send_gap_ms` (end-of-utterance), when `min_chunk_ms` of
    /// audio has accumulated, or when `send_gap_ms` has passed since the
    /// last send. All three are evaluated on every frame - the accumulation
    /// trigger is what keeps audio flowing right after a send reset the
    /// send timer.
    pub fn take_due_chunk(&self, config: &AsrConfig) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.buffer.is_empty() {
            return None;
        }

        let buffered_ms = pcm16_bytes_to_ms(inner.buffer.len(), self.sample_rate);

        let due = if !inner.warmed_up {
            buffered_ms >= config.warmup_ms
        } else {
            inner.last_frame_gap_ms >= config.send_gap_ms
                || buffered_ms >= config.min_chunk_ms
                || inner.last_send_at.elapsed().as_millis() as u64 >= config.send_gap_ms
        };
        if !due {
            return None;
        }

        inner.warmed_up = true;
        inner.last_send_at = Instant::now();
        let chunk = inner.buffer.split().freeze();
        Some(chunk)
    }

    /// Milliseconds of audio currently buffered.
    #[must_use]
    pub fn buffered_ms(&self) -> u64 {
        pcm16_bytes_to_ms(self.inner.lock().buffer.len(), self.sample_rate)
    }

    /// Time since the last frame arrived.
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.inner.lock().last_frame_at.elapsed()
    }

    /// Time since the last send, for latency accounting.
    #[must_use]
    pub fn ms_since_last_send(&self) -> u64 {
        self.inner.lock().last_send_at.elapsed().as_millis() as u64
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transcript Sequencing & Latency
    // ─────────────────────────────────────────────────────────────────────

    /// Allocates the next transcript seq (starts at 1).
    pub fn next_seq(&self) -> u64 {
        self.next_transcript_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Records the first successful chunk send.
    pub fn record_chunk_sent(&self) {
        let _ = self.first_chunk_sent_at.set(Instant::now());
    }

    /// Returns first-partial latency exactly once, on the first transcript.
    pub fn take_first_partial_latency(&self) -> Option<u64> {
        if self
            .first_transcript_seen
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        self.first_chunk_sent_at
            .get()
            .map(|sent| sent.elapsed().as_millis() as u64)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Early-Audio Filter
    // ─────────────────────────────────────────────────────────────────────

    /// Decides whether a transcript may be published.
    ///
    /// From the first frame until either the early-audio window elapses or
    /// a non-filler transcript arrives, filler transcripts are suppressed.
    /// Once speech is detected (or the window passes) filtering disengages
    /// for the rest of the interaction.
    pub fn should_publish(&self, text: &str, config: &AsrConfig) -> bool {
        if !self.filter_engaged.load(Ordering::Acquire) {
            return true;
        }

        if self.first_frame_at.elapsed().as_millis() as u64 >= config.early_audio_window_ms {
            self.filter_engaged.store(false, Ordering::Release);
            return true;
        }

        if is_filler(text) {
            return false;
        }

        self.speech_detected.store(true, Ordering::Release);
        self.filter_engaged.store(false, Ordering::Release);
        true
    }

    /// Whether a non-filler transcript has been seen.
    #[must_use]
    pub fn speech_detected(&self) -> bool {
        self.speech_detected.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Error Cool-down
    // ─────────────────────────────────────────────────────────────────────

    /// Records a failed STT open.
    pub fn record_open_error(&self) {
        *self.last_error_at.lock() = Some(Instant::now());
    }

    /// Whether the retry cool-down after the last open failure is active.
    #[must_use]
    pub fn in_cooldown(&self, config: &AsrConfig) -> bool {
        self.last_error_at
            .lock()
            .map(|at| (at.elapsed().as_millis() as u64) < config.reconnect_cooldown_ms)
            .unwrap_or(false)
    }
}

/// Filler = listed filler word or punctuation-only text.
#[must_use]
pub fn is_filler(text: &str) -> bool {
    let cleaned: String = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        return true;
    }
    FILLER_WORDS.contains(&cleaned.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> InteractionState {
        InteractionState::new("call-1", "acme", 8000, true)
    }

    fn config() -> AsrConfig {
        AsrConfig::default()
    }

    /// 20 ms of PCM16 at 8 kHz.
    fn frame() -> Vec<u8> {
        vec![0u8; 320]
    }

    #[test]
    fn warmup_holds_until_500ms_buffered() {
        let state = state();
        let config = config();

        // 24 frames = 480 ms: still warming up.
        for _ in 0..24 {
            state.append_frame(&frame());
            assert!(state.take_due_chunk(&config).is_none());
        }

        // Frame 25 crosses 500 ms: one chunk with everything so far.
        state.append_frame(&frame());
        let chunk = state.take_due_chunk(&config).unwrap();
        assert_eq!(chunk.len(), 25 * 320);
        assert_eq!(state.buffered_ms(), 0);
    }

    #[test]
    fn accumulation_trigger_fires_after_warmup() {
        let state = state();
        let config = config();

        for _ in 0..25 {
            state.append_frame(&frame());
        }
        assert!(state.take_due_chunk(&config).is_some());

        // After the warm-up send, 200 ms of new audio triggers the next one
        // even though the send timer was just reset.
        for _ in 0..9 {
            state.append_frame(&frame());
            assert!(state.take_due_chunk(&config).is_none());
        }
        state.append_frame(&frame());
        let chunk = state.take_due_chunk(&config).unwrap();
        assert_eq!(chunk.len(), 10 * 320);
    }

    #[test]
    fn empty_buffer_never_sends() {
        let state = state();
        assert!(state.take_due_chunk(&config()).is_none());
    }

    #[test]
    fn transcript_seq_is_monotonic_from_one() {
        let state = state();
        assert_eq!(state.next_seq(), 1);
        assert_eq!(state.next_seq(), 2);
        assert_eq!(state.next_seq(), 3);
    }

    #[test]
    fn filler_detection() {
        assert!(is_filler("um"));
        assert!(is_filler(" Uh. "));
        assert!(is_filler("..."));
        assert!(is_filler(""));
        assert!(!is_filler("I need to reset my password"));
        assert!(!is_filler("umbrella"));
    }

    #[test]
    fn early_filter_suppresses_filler_then_disengages_on_speech() {
        let state = state();
        let config = config();

        assert!(!state.should_publish("um", &config));
        assert!(!state.speech_detected());

        assert!(state.should_publish("I need to reset my password", &config));
        assert!(state.speech_detected());

        // Filter disengaged: filler now passes for the rest of the call.
        assert!(state.should_publish("um", &config));
    }

    #[test]
    fn early_filter_disengages_after_window() {
        let state = state();
        let mut config = config();
        config.early_audio_window_ms = 0;

        // Window already elapsed: even filler is published.
        assert!(state.should_publish("um", &config));
        assert!(state.should_publish("uh", &config));
    }

    #[test]
    fn disabled_filter_publishes_everything() {
        let state = InteractionState::new("call-1", "acme", 8000, false);
        assert!(state.should_publish("um", &config()));
    }

    #[test]
    fn first_partial_latency_reported_once() {
        let state = state();
        state.record_chunk_sent();

        assert!(state.take_first_partial_latency().is_some());
        assert!(state.take_first_partial_latency().is_none());
    }

    #[test]
    fn cooldown_window() {
        let state = state();
        let config = config();
        assert!(!state.in_cooldown(&config));
        state.record_open_error();
        assert!(state.in_cooldown(&config));
    }
}
