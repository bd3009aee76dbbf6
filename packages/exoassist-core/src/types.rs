//! Core data model shared across pipeline components.
//!
//! Audio frames and transcripts are ephemeral and transport-owned between
//! components; everything here is designed to round-trip through the bus
//! envelope as JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol_constants::{PCM16_ENCODING, SUPPORTED_SAMPLE_RATES};

// ─────────────────────────────────────────────────────────────────────────────
// Audio Frames
// ─────────────────────────────────────────────────────────────────────────────

/// One frame of raw PCM16 audio, produced by the ingest and consumed by the
/// ASR worker.
///
/// Within an interaction `seq` is strictly increasing and gapless from the
/// producer's perspective; consumers must not assume gaplessness after
/// transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFrame {
    pub tenant_id: String,
    pub interaction_id: String,
    /// Monotonic per interaction, starts at 1.
    pub seq: u64,
    pub timestamp_ms: u64,
    /// One of 8000, 16000, 24000.
    pub sample_rate: u32,
    /// Always `pcm16`.
    pub encoding: String,
    /// Raw little-endian 16-bit mono PCM, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub audio: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl AudioFrame {
    /// Duration of this frame in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        crate::utils::pcm16_bytes_to_ms(self.audio.len(), self.sample_rate)
    }
}

/// Validates that a sample rate is one the pipeline supports.
#[must_use]
pub fn is_supported_sample_rate(rate: u32) -> bool {
    SUPPORTED_SAMPLE_RATES.contains(&rate)
}

/// Returns the fixed encoding name for audio frames.
#[must_use]
pub fn pcm16_encoding() -> String {
    PCM16_ENCODING.to_string()
}

/// Serde adapter storing `Bytes` as base64 text in JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcripts
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a transcript is still subject to revision by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    /// May be revised by subsequent results.
    Partial,
    /// Committed by the provider, typically after a voice-activity pause.
    Final,
}

/// Which side of the call the provider attributed the speech to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    Customer,
    #[default]
    Unknown,
}

impl Speaker {
    /// Parses a provider speaker label, falling back to `Unknown`.
    #[must_use]
    pub fn parse(label: Option<&str>) -> Self {
        match label.map(str::to_ascii_lowercase).as_deref() {
            Some("agent") => Self::Agent,
            Some("customer") | Some("caller") => Self::Customer,
            _ => Self::Unknown,
        }
    }
}

/// One transcript line, produced by the ASR worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub interaction_id: String,
    /// Monotonic per interaction.
    pub seq: u64,
    pub ts: u64,
    /// Non-empty after filtering.
    pub text: String,
    pub kind: TranscriptKind,
    #[serde(default)]
    pub speaker: Speaker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Intent & Knowledge Base
// ─────────────────────────────────────────────────────────────────────────────

/// Result of classifying the caller's current intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentVerdict {
    pub interaction_id: String,
    pub seq: u64,
    /// Normalised snake_case, max 50 chars; `unknown` when unclassifiable.
    pub intent: String,
    /// Clamped to [0, 1].
    pub confidence: f32,
    pub ts: u64,
}

impl IntentVerdict {
    /// The verdict used when classification fails or times out.
    #[must_use]
    pub fn unknown(interaction_id: &str, seq: u64) -> Self {
        Self {
            interaction_id: interaction_id.to_string(),
            seq,
            intent: "unknown".to_string(),
            confidence: 0.0,
            ts: crate::utils::now_millis(),
        }
    }

    /// Whether the verdict carries a usable intent.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.intent != "unknown"
    }
}

/// A knowledge-base article surfaced for the current intent.
///
/// Retrieval only - the pipeline never writes KB articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbArticle {
    pub id: String,
    pub title: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Name of the adapter that produced the article.
    pub source: String,
    /// Clamped to [0, 1].
    pub confidence: f32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Call Summary & Dispositions
// ─────────────────────────────────────────────────────────────────────────────

/// A disposition suggested by the summary flow, mapped against the tenant's
/// taxonomy where possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispositionSuggestion {
    pub code: String,
    pub title: String,
    pub score: f32,
    /// Taxonomy id attached when the suggestion matched the tenant taxonomy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxonomy_id: Option<String>,
}

/// End-of-call summary, produced once per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    pub interaction_id: String,
    pub issue: String,
    pub resolution: String,
    pub next_steps: String,
    pub dispositions: Vec<DispositionSuggestion>,
    pub confidence: f32,
    /// True when the LLM reply did not match the expected schema and the
    /// raw output was preserved under `resolution` instead.
    pub used_fallback: bool,
}
