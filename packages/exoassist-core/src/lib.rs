//! Exo Assist Core - shared library for the Exo Assist pipeline.
//!
//! This crate provides the core functionality for Exo Assist, a real-time
//! agent-assist system for telephony call centres. A telephony provider
//! streams raw PCM audio of a live call over a WebSocket; the pipeline
//! transcribes it, classifies caller intent, surfaces knowledge-base
//! articles and produces an end-of-call disposition summary, pushing every
//! step to browser dashboards as Server-Sent Events.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`ingest`]: Telephony WebSocket termination and frame publishing
//! - [`bus`]: Pluggable pub/sub transport (Redis Streams, Kafka, in-memory)
//! - [`asr`]: Per-interaction streaming speech-to-text worker
//! - [`stt`]: Streaming STT provider client
//! - [`consumer`]: Transcript consumer with intent and KB enrichment
//! - [`fanout`]: SSE hub pushing events to dashboard clients
//! - [`registry`]: Short-lived active-call registry
//! - [`summary`]: End-of-call summary and disposition mapping
//! - [`llm`] / [`kb`]: External LLM and knowledge-base adapters
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! The crate defines traits to decouple the pipeline from external
//! collaborators:
//!
//! - [`MessageBus`](bus::MessageBus): Publish/subscribe transport
//! - [`SttProvider`](stt::SttProvider): Streaming speech-to-text
//! - [`LlmClient`](llm::LlmClient): Intent and summary completions
//! - [`KbAdapter`](kb::KbAdapter): Knowledge-base retrieval
//! - [`CallRegistry`](registry::CallRegistry): Active-call store
//! - [`AssistStore`](store::AssistStore): Write-through persistence
//!
//! Each trait has a default implementation suitable for the standalone
//! server plus an in-memory variant used in tests.

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod asr;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod kb;
pub mod llm;
pub mod metrics;
pub mod protocol_constants;
pub mod registry;
pub mod store;
pub mod stt;
pub mod summary;
pub mod tenant;
pub mod types;
pub mod utils;

// Re-export commonly used types at the crate root
pub use bus::{create_bus, BusAdapter, Envelope, MessageBus};
pub use config::{AsrConfig, Config, ConsumerConfig, IngestConfig};
pub use error::{AssistError, AssistResult, ErrorCode};
pub use fanout::{AssistEvent, FanoutHub};
pub use metrics::MetricsHub;
pub use registry::{CallRegistry, CallRegistryEntry, CallStatus};
pub use types::{
    AudioFrame, CallSummary, IntentVerdict, KbArticle, Speaker, Transcript, TranscriptKind,
};
pub use utils::now_millis;

// Re-export bootstrap types
pub use bootstrap::{bootstrap_services, BootstrappedServices};

// Re-export API types
pub use api::{start_server, AppState, AppStateBuilder, ServerError};
