//! Short-lived registry of active calls.
//!
//! Keyed by `interaction_id` with a TTL after last activity. The registry
//! backs dashboard auto-discovery (`list_active`) and the transcript
//! consumer's dynamic topic subscription. Entries are shared-read,
//! single-writer: the ingest connection that started the call owns the
//! writes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AssistResult;

pub mod memory;
pub mod redis;

pub use memory::MemoryRegistry;
pub use redis::RedisRegistry;

/// Lifecycle state of a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Active,
    Ended,
}

/// One active (or recently ended) call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRegistryEntry {
    pub interaction_id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Unix millis; never updated after registration.
    pub started_at: u64,
    /// Unix millis; refreshed by `touch` on every inbound frame.
    pub last_activity_at: u64,
    pub status: CallStatus,
    /// Opaque provider metadata (stream sid, caller/callee numbers, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CallRegistryEntry {
    /// Creates a fresh active entry stamped with the current time.
    #[must_use]
    pub fn new(interaction_id: &str, tenant_id: &str) -> Self {
        let now = crate::utils::now_millis();
        Self {
            interaction_id: interaction_id.to_string(),
            tenant_id: tenant_id.to_string(),
            agent_id: None,
            started_at: now,
            last_activity_at: now,
            status: CallStatus::Active,
            metadata: HashMap::new(),
        }
    }
}

/// Key-value store of active calls with TTL.
#[async_trait]
pub trait CallRegistry: Send + Sync {
    /// Writes a new entry (or replaces a stale one with the same id).
    async fn register(&self, entry: CallRegistryEntry) -> AssistResult<()>;

    /// Refreshes `last_activity_at`. Idempotent; unknown ids are a no-op.
    async fn touch(&self, interaction_id: &str) -> AssistResult<()>;

    /// Flips the entry to `Ended`. Unknown ids are a no-op.
    async fn mark_ended(&self, interaction_id: &str) -> AssistResult<()>;

    /// Fetches one entry if it exists and has not expired.
    async fn get(&self, interaction_id: &str) -> AssistResult<Option<CallRegistryEntry>>;

    /// Returns active entries ordered by `last_activity_at` descending.
    async fn list_active(&self, limit: usize) -> AssistResult<Vec<CallRegistryEntry>>;
}
