//! Write-through persistence seam.
//!
//! Transcripts, intents and dispositions are persisted as a side effect of
//! the streaming pipeline; failures here never block broadcasts. The row
//! shapes are fixed; the storage engine behind them is not part of the
//! core - `MemoryStore` backs single-process deployments and tests, and a
//! SQL implementation fills the same trait in larger installations.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Speaker;

/// Storage failure. Callers log and continue; nothing in the pipeline
/// propagates these.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store write failed: {0}")]
    Write(String),
}

/// One persisted transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRow {
    pub call_id: String,
    pub seq: u64,
    pub ts: u64,
    pub text: String,
    pub speaker: Speaker,
}

/// One persisted intent verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRow {
    pub call_id: String,
    pub seq: u64,
    pub intent: String,
    pub confidence: f32,
}

/// One persisted agent-chosen disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispositionRow {
    pub call_id: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub ts: u64,
}

/// Write-through store for pipeline side effects.
#[async_trait]
pub trait AssistStore: Send + Sync {
    async fn save_transcript_line(&self, row: TranscriptRow) -> Result<(), StoreError>;

    async fn save_intent(&self, row: IntentRow) -> Result<(), StoreError>;

    async fn save_disposition(&self, row: DispositionRow) -> Result<(), StoreError>;

    /// Returns all stored transcript lines for a call ordered by `seq`.
    async fn transcript_for_call(&self, call_id: &str) -> Result<Vec<TranscriptRow>, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-Memory Store
// ─────────────────────────────────────────────────────────────────────────────

/// DashMap-backed store for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    transcripts: DashMap<String, Vec<TranscriptRow>>,
    intents: DashMap<String, Vec<IntentRow>>,
    dispositions: DashMap<String, Vec<DispositionRow>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored intents for a call (test/debug accessor).
    #[must_use]
    pub fn intents_for_call(&self, call_id: &str) -> Vec<IntentRow> {
        self.intents
            .get(call_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Stored dispositions for a call (test/debug accessor).
    #[must_use]
    pub fn dispositions_for_call(&self, call_id: &str) -> Vec<DispositionRow> {
        self.dispositions
            .get(call_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AssistStore for MemoryStore {
    async fn save_transcript_line(&self, row: TranscriptRow) -> Result<(), StoreError> {
        let mut rows = self.transcripts.entry(row.call_id.clone()).or_default();
        // Idempotent on (call_id, seq): redelivered lines replace in place.
        if let Some(existing) = rows.iter_mut().find(|r| r.seq == row.seq) {
            *existing = row;
        } else {
            rows.push(row);
        }
        Ok(())
    }

    async fn save_intent(&self, row: IntentRow) -> Result<(), StoreError> {
        let mut rows = self.intents.entry(row.call_id.clone()).or_default();
        if let Some(existing) = rows.iter_mut().find(|r| r.seq == row.seq) {
            *existing = row;
        } else {
            rows.push(row);
        }
        Ok(())
    }

    async fn save_disposition(&self, row: DispositionRow) -> Result<(), StoreError> {
        self.dispositions
            .entry(row.call_id.clone())
            .or_default()
            .push(row);
        Ok(())
    }

    async fn transcript_for_call(&self, call_id: &str) -> Result<Vec<TranscriptRow>, StoreError> {
        let mut rows = self
            .transcripts
            .get(call_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(call_id: &str, seq: u64, text: &str) -> TranscriptRow {
        TranscriptRow {
            call_id: call_id.to_string(),
            seq,
            ts: seq * 100,
            text: text.to_string(),
            speaker: Speaker::Customer,
        }
    }

    #[tokio::test]
    async fn transcript_returned_in_seq_order() {
        let store = MemoryStore::new();
        store.save_transcript_line(line("c1", 3, "three")).await.unwrap();
        store.save_transcript_line(line("c1", 1, "one")).await.unwrap();
        store.save_transcript_line(line("c1", 2, "two")).await.unwrap();

        let rows = store.transcript_for_call("c1").await.unwrap();
        let texts: Vec<_> = rows.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn redelivered_seq_replaces_instead_of_duplicating() {
        let store = MemoryStore::new();
        store.save_transcript_line(line("c1", 1, "first")).await.unwrap();
        store.save_transcript_line(line("c1", 1, "revised")).await.unwrap();

        let rows = store.transcript_for_call("c1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "revised");
    }

    #[tokio::test]
    async fn unknown_call_yields_empty_transcript() {
        let store = MemoryStore::new();
        assert!(store.transcript_for_call("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispositions_append() {
        let store = MemoryStore::new();
        store
            .save_disposition(DispositionRow {
                call_id: "c1".into(),
                code: "resolved".into(),
                title: None,
                agent_id: Some("agent-9".into()),
                ts: 1,
            })
            .await
            .unwrap();
        assert_eq!(store.dispositions_for_call("c1").len(), 1);
    }
}
