//! In-memory per-call transcript cache.
//!
//! Backs the HTTP polling-fallback read path. Entries are keyed by
//! `interaction_id` with a freshness TTL: stale reads return nothing, and a
//! periodic sweep reclaims memory.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::types::{Speaker, Transcript};

/// One cached transcript line.
#[derive(Debug, Clone, Serialize)]
pub struct CachedLine {
    pub seq: u64,
    pub text: String,
    pub ts: u64,
    pub speaker: Speaker,
}

struct CachedCall {
    lines: Vec<CachedLine>,
    last_touched: Instant,
}

/// Per-call transcript list with freshness TTL.
pub struct TranscriptCache {
    calls: DashMap<String, CachedCall>,
    ttl: Duration,
}

impl TranscriptCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            calls: DashMap::new(),
            ttl,
        }
    }

    /// Appends one line, idempotent on `seq` (redeliveries replace).
    pub fn append(&self, transcript: &Transcript) {
        let line = CachedLine {
            seq: transcript.seq,
            text: transcript.text.clone(),
            ts: transcript.ts,
            speaker: transcript.speaker,
        };

        let mut call = self
            .calls
            .entry(transcript.interaction_id.clone())
            .or_insert_with(|| CachedCall {
                lines: Vec::new(),
                last_touched: Instant::now(),
            });
        call.last_touched = Instant::now();
        if let Some(existing) = call.lines.iter_mut().find(|l| l.seq == transcript.seq) {
            *existing = line;
        } else {
            call.lines.push(line);
        }
    }

    /// Returns the call's lines ordered by seq, or None when missing/stale.
    #[must_use]
    pub fn read(&self, interaction_id: &str) -> Option<Vec<CachedLine>> {
        let call = self.calls.get(interaction_id)?;
        if call.last_touched.elapsed() > self.ttl {
            return None;
        }
        let mut lines = call.lines.clone();
        lines.sort_by_key(|l| l.seq);
        Some(lines)
    }

    /// Drops stale calls. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.calls.len();
        let ttl = self.ttl;
        self.calls.retain(|_, call| call.last_touched.elapsed() <= ttl);
        before - self.calls.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TranscriptKind;

    fn transcript(seq: u64, text: &str) -> Transcript {
        Transcript {
            interaction_id: "call-1".into(),
            seq,
            ts: seq * 100,
            text: text.into(),
            kind: TranscriptKind::Final,
            speaker: Speaker::Customer,
            confidence: None,
        }
    }

    #[test]
    fn append_and_read_in_seq_order() {
        let cache = TranscriptCache::new(Duration::from_secs(3600));
        cache.append(&transcript(2, "world"));
        cache.append(&transcript(1, "hello"));

        let lines = cache.read("call-1").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "hello");
        assert_eq!(lines[1].text, "world");
    }

    #[test]
    fn redelivery_replaces_by_seq() {
        let cache = TranscriptCache::new(Duration::from_secs(3600));
        cache.append(&transcript(1, "partial"));
        cache.append(&transcript(1, "revised"));

        let lines = cache.read("call-1").unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "revised");
    }

    #[test]
    fn unknown_call_reads_none() {
        let cache = TranscriptCache::new(Duration::from_secs(3600));
        assert!(cache.read("nope").is_none());
    }

    #[test]
    fn stale_entries_hidden_and_swept() {
        let cache = TranscriptCache::new(Duration::from_millis(0));
        cache.append(&transcript(1, "hello"));
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.read("call-1").is_none());
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.is_empty());
    }
}
