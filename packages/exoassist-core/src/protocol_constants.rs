//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external specifications (the telephony
//! provider's media protocol, the STT provider's session contract, SSE)
//! and changing them would break protocol compliance.

// ─────────────────────────────────────────────────────────────────────────────
// Telephony Media Protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Duration of one telephony media frame (milliseconds).
///
/// The provider ships one `media` event roughly every 20 ms; frame length
/// validation and the ingest fallback buffer are both sized from this.
pub const MEDIA_FRAME_MS: u64 = 20;

/// Tolerance applied to frame-length validation (fraction of expected bytes).
///
/// A 20 ms frame at the declared sample rate may deviate by up to ±10%
/// before it is rejected as malformed.
pub const MEDIA_FRAME_TOLERANCE: f64 = 0.10;

/// Sample rates the ingest accepts (Hz).
pub const SUPPORTED_SAMPLE_RATES: [u32; 3] = [8000, 16000, 24000];

/// The only audio encoding the pipeline carries.
///
/// Raw little-endian 16-bit mono PCM. The telephony provider base64-encodes
/// it on the wire; the ingest decodes it exactly once.
pub const PCM16_ENCODING: &str = "pcm16";

/// Bytes per PCM16 sample.
pub const PCM16_BYTES_PER_SAMPLE: u64 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Streaming STT Session Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between zero-length keepalive frames when no audio is flowing
/// (seconds). Required by the provider to hold an idle session open.
pub const STT_KEEPALIVE_INTERVAL_SECS: u64 = 3;

/// Minimum buffered audio before the first chunk is sent to the STT provider
/// (milliseconds). Amortises session setup and meets provider minimums.
pub const STT_WARMUP_MS: u64 = 500;

/// Accumulated-audio threshold that triggers a send after warm-up (ms).
pub const STT_MIN_CHUNK_MS: u64 = 200;

/// End-of-utterance heuristic: a send fires when no frame has arrived for
/// this long (ms). Also the cap on time between consecutive sends.
pub const STT_SEND_GAP_MS: u64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Early-Audio Filtering
// ─────────────────────────────────────────────────────────────────────────────

/// Window after the first frame during which filler transcripts are
/// suppressed (milliseconds). Once a non-filler transcript is seen, or this
/// window elapses, filtering disengages for the rest of the interaction.
pub const EARLY_AUDIO_WINDOW_MS: u64 = 2000;

/// Filler tokens that do not count as detected speech.
pub const FILLER_WORDS: [&str; 4] = ["um", "uh", "hmm", "mm"];

// ─────────────────────────────────────────────────────────────────────────────
// SSE
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between SSE heartbeat comments (seconds).
///
/// Keeps intermediaries from timing out idle event streams.
pub const SSE_HEARTBEAT_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout for LLM HTTP requests (seconds).
pub const LLM_TIMEOUT_SECS: u64 = 10;

/// Timeout for external-service KB queries (seconds).
pub const KB_SERVICE_TIMEOUT_SECS: u64 = 5;

/// Timeout for opening an STT session, including token minting (seconds).
pub const STT_CONNECT_TIMEOUT_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Registry / Cache Lifetimes
// ─────────────────────────────────────────────────────────────────────────────

/// TTL for call registry entries after last activity (seconds).
pub const CALL_TTL_SECS: u64 = 3600;

/// Freshness TTL for the in-memory transcript cache (seconds).
///
/// Matches the registry TTL so the polling fallback and auto-discovery
/// expire together.
pub const TRANSCRIPT_CACHE_TTL_SECS: u64 = 3600;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in outbound protocol data.
pub const APP_NAME: &str = "Exo Assist";

/// Service identifier reported by the health endpoint.
///
/// Dashboards probe `/health` and expect this exact string to identify a
/// valid Exo Assist server.
pub const SERVICE_ID: &str = "exoassist";

// ─────────────────────────────────────────────────────────────────────────────
// Channel Capacities
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of each SSE client's outbound frame channel.
pub const SSE_CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of each per-call ordered processing queue in the consumer.
pub const CALL_QUEUE_CAPACITY: usize = 128;

/// Capacity of the per-interaction STT event channel.
pub const STT_EVENT_CHANNEL_CAPACITY: usize = 64;
