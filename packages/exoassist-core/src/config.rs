//! Core application configuration.
//!
//! Provides validated configuration for every pipeline component. All fields
//! have sensible defaults; the environment switches carried over from
//! deployments (`PUBSUB_ADAPTER`, `EXO_*`) are applied by
//! [`Config::apply_env_overrides`].

use serde::{Deserialize, Serialize};

use crate::bus::BusAdapter;
use crate::protocol_constants::{
    CALL_TTL_SECS, EARLY_AUDIO_WINDOW_MS, STT_CONNECT_TIMEOUT_SECS, STT_MIN_CHUNK_MS,
    STT_SEND_GAP_MS, STT_WARMUP_MS, TRANSCRIPT_CACHE_TTL_SECS,
};

/// Configuration for the telephony ingest.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Wall-clock size of the publish fallback buffer (milliseconds).
    /// Frames older than this are dropped oldest-first during a bus outage.
    /// Override: `EXO_MAX_BUFFER_MS`
    pub max_buffer_ms: u64,

    /// Idle watchdog: close the connection when no media frame has arrived
    /// for this long (seconds). Override: `EXO_IDLE_CLOSE_S`
    pub idle_close_s: u64,

    /// Number of fallback-buffer drops after which the connection is closed
    /// (bus persistently unreachable).
    pub max_buffer_drops: u64,

    /// Whether the telephony bridge WebSocket route is mounted at all.
    /// Override: `EXO_BRIDGE_ENABLED`
    pub bridge_enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_buffer_ms: 500,
            idle_close_s: 10,
            max_buffer_drops: 250,
            bridge_enabled: true,
        }
    }
}

/// Configuration for the ASR worker.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AsrConfig {
    /// Buffered audio required before the first send to the STT provider (ms).
    pub warmup_ms: u64,

    /// Accumulated-audio threshold triggering a send after warm-up (ms).
    pub min_chunk_ms: u64,

    /// End-of-utterance gap / maximum time between sends (ms).
    pub send_gap_ms: u64,

    /// Destroy interaction state when no frame has arrived for this long
    /// (seconds). Override: `EXO_IDLE_CLOSE_S`
    pub idle_close_s: u64,

    /// Whether early-audio filtering is engaged for new interactions.
    /// Override: `EXO_EARLY_AUDIO_FILTER`
    pub early_audio_filter: bool,

    /// Early-audio suppression window after the first frame (ms).
    pub early_audio_window_ms: u64,

    /// RMS amplitude below which a chunk is skipped as silence.
    pub silence_rms_threshold: f64,

    /// Cool-down after a failed STT open before the next frame retries (ms).
    pub reconnect_cooldown_ms: u64,

    /// Bounded retries for a transcript publish before it is dropped.
    pub publish_retries: u32,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            warmup_ms: STT_WARMUP_MS,
            min_chunk_ms: STT_MIN_CHUNK_MS,
            send_gap_ms: STT_SEND_GAP_MS,
            idle_close_s: 10,
            early_audio_filter: true,
            early_audio_window_ms: EARLY_AUDIO_WINDOW_MS,
            silence_rms_threshold: 60.0,
            reconnect_cooldown_ms: 500,
            publish_retries: 3,
        }
    }
}

/// Configuration for the transcript consumer and fan-out.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Freshness TTL for the in-memory transcript cache (seconds).
    pub cache_ttl_s: u64,

    /// Interval between registry auto-discovery polls (milliseconds).
    pub discovery_interval_ms: u64,

    /// Minimum trimmed transcript length before intent classification runs.
    pub min_intent_chars: usize,

    /// Default number of KB articles returned when the tenant config does
    /// not override it.
    pub default_max_articles: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_s: TRANSCRIPT_CACHE_TTL_SECS,
            discovery_interval_ms: 1000,
            min_intent_chars: 10,
            default_max_articles: 3,
        }
    }
}

/// Which STT provider implementation to use.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SttProviderKind {
    /// Real streaming WebSocket provider (requires credentials).
    Websocket,
    /// In-process mock for development and tests.
    Mock,
}

/// Configuration for the streaming STT provider connection.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SttConfig {
    pub provider: SttProviderKind,

    /// Base URL of the provider (token endpoint derived from it).
    /// Override: `EXO_STT_BASE_URL`
    pub base_url: String,

    /// API key used to mint single-use session tokens.
    /// Override: `EXO_STT_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Timeout for session establishment, including token minting (seconds).
    pub connect_timeout_s: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProviderKind::Mock,
            base_url: "https://stt.example.com".to_string(),
            api_key: None,
            connect_timeout_s: STT_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Which LLM client implementation to use.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    /// Real chat-completions endpoint (requires credentials).
    Http,
    /// Scripted in-process mock for development and tests.
    Mock,
}

/// Configuration for the external LLM used for intent and summaries.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,

    /// Chat-completions base URL. Override: `EXO_LLM_BASE_URL`
    pub base_url: String,

    /// Override: `EXO_LLM_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    pub intent_model: String,
    pub summary_model: String,

    /// Kept low so intent labels stay stable across near-identical text.
    pub intent_temperature: f32,
    pub summary_temperature: f32,

    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Mock,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            intent_model: "gpt-4o-mini".to_string(),
            summary_model: "gpt-4o-mini".to_string(),
            intent_temperature: 0.2,
            summary_temperature: 0.5,
            timeout_s: crate::protocol_constants::LLM_TIMEOUT_SECS,
        }
    }
}

/// Which call-registry backing to use.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    Redis,
}

/// Configuration for the call registry.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// Entry TTL after last activity (seconds).
    pub ttl_s: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Memory,
            ttl_s: CALL_TTL_SECS,
        }
    }
}

/// Configuration for the pub/sub transport.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    /// Backing selection. Override: `PUBSUB_ADAPTER` (streams|log|memory)
    pub adapter: BusAdapter,

    /// Redis connection URL for the streams backing.
    /// Override: `EXO_REDIS_URL`
    pub redis_url: String,

    /// Kafka bootstrap servers for the partitioned-log backing.
    /// Override: `EXO_KAFKA_BROKERS`
    pub kafka_brokers: String,

    /// When true audio frames for all tenants share one `audio_stream`
    /// topic; otherwise each tenant gets `audio.{tenant_id}`.
    pub shared_audio_topic: bool,

    /// Tenants whose `audio.{tenant_id}` topics the ASR worker consumes
    /// when `shared_audio_topic` is off.
    #[serde(default)]
    pub audio_tenants: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            adapter: BusAdapter::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            kafka_brokers: "127.0.0.1:9092".to_string(),
            shared_audio_topic: true,
            audio_tenants: Vec::new(),
        }
    }
}

/// Configuration for the Exo Assist pipeline.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Preferred port for the HTTP/WS server (0 = auto-allocate).
    #[serde(default)]
    pub preferred_port: u16,

    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub asr: AsrConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Config {
    /// Applies the environment switches used by deployments.
    ///
    /// Unparseable values are ignored in favour of the current setting.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PUBSUB_ADAPTER") {
            if let Some(adapter) = BusAdapter::parse(&val) {
                self.bus.adapter = adapter;
            }
        }
        if let Ok(val) = std::env::var("EXO_REDIS_URL") {
            self.bus.redis_url = val;
        }
        if let Ok(val) = std::env::var("EXO_KAFKA_BROKERS") {
            self.bus.kafka_brokers = val;
        }
        if let Ok(val) = std::env::var("EXO_MAX_BUFFER_MS") {
            if let Ok(ms) = val.parse() {
                self.ingest.max_buffer_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("EXO_IDLE_CLOSE_S") {
            if let Ok(secs) = val.parse() {
                self.ingest.idle_close_s = secs;
                self.asr.idle_close_s = secs;
            }
        }
        if let Ok(val) = std::env::var("EXO_EARLY_AUDIO_FILTER") {
            self.asr.early_audio_filter = !matches!(val.as_str(), "0" | "false" | "off");
        }
        if let Ok(val) = std::env::var("EXO_BRIDGE_ENABLED") {
            self.ingest.bridge_enabled = !matches!(val.as_str(), "0" | "false" | "off");
        }
        if let Ok(val) = std::env::var("EXO_STT_BASE_URL") {
            self.stt.base_url = val;
        }
        if let Ok(val) = std::env::var("EXO_STT_API_KEY") {
            self.stt.api_key = Some(val);
            self.stt.provider = SttProviderKind::Websocket;
        }
        if let Ok(val) = std::env::var("EXO_LLM_BASE_URL") {
            self.llm.base_url = val;
        }
        if let Ok(val) = std::env::var("EXO_LLM_API_KEY") {
            self.llm.api_key = Some(val);
            self.llm.provider = LlmProviderKind::Http;
        }
    }

    /// Validates the configuration values.
    ///
    /// Credentials are checked at bootstrap (fail-fast), not here: a config
    /// selecting the mock provider is valid without any keys.
    pub fn validate(&self) -> Result<(), String> {
        if self.ingest.max_buffer_ms == 0 {
            return Err("ingest.max_buffer_ms must be >= 1".to_string());
        }
        if self.ingest.idle_close_s == 0 {
            return Err("ingest.idle_close_s must be >= 1".to_string());
        }
        if self.asr.warmup_ms < self.asr.min_chunk_ms {
            return Err("asr.warmup_ms must be >= asr.min_chunk_ms".to_string());
        }
        if self.asr.publish_retries == 0 {
            return Err("asr.publish_retries must be >= 1".to_string());
        }
        if self.consumer.discovery_interval_ms == 0 {
            return Err("consumer.discovery_interval_ms must be >= 1".to_string());
        }
        if self.registry.ttl_s == 0 {
            return Err("registry.ttl_s must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn default_config_is_sensible() {
        let config = Config::default();
        assert_eq!(config.ingest.max_buffer_ms, 500);
        assert_eq!(config.ingest.idle_close_s, 10);
        assert!(config.asr.early_audio_filter);
        assert_eq!(config.bus.adapter, BusAdapter::Memory);
    }

    #[test]
    fn zero_buffer_rejected() {
        let mut config = Config::default();
        config.ingest.max_buffer_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn warmup_below_chunk_rejected() {
        let mut config = Config::default();
        config.asr.warmup_ms = 100;
        config.asr.min_chunk_ms = 200;
        assert!(config.validate().is_err());
    }
}
