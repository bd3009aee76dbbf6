//! Per-interaction STT connection map.
//!
//! Guarantees at most one live provider session per interaction even when
//! frames for the same interaction arrive concurrently. A naive
//! check-then-create races: two concurrent lookups both see "no session"
//! and both open one. Instead, creation goes through a promise map:
//!
//! 1. a caller that finds a creation already in flight awaits the same
//!    shared future and receives the same handle
//! 2. otherwise the caller registers a shared future atomically (under the
//!    map shard lock, with no await), then drives the creation
//! 3. the creator publishes the result to the ready map and deregisters the
//!    future; an error leaves both maps empty so the next call cleanly
//!    re-enters creation
//!
//! Removal on error or close happens before any subsequent send can observe
//! the stale handle.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::metrics::AsrMetrics;
use crate::stt::{SttError, SttSession};

type ConnectResult = Result<Arc<SttSession>, SttError>;
type PendingConnect = Shared<BoxFuture<'static, ConnectResult>>;

/// Session registry with single-flight creation.
#[derive(Default)]
pub struct SttConnectionMap {
    ready: DashMap<String, Arc<SttSession>>,
    pending: DashMap<String, PendingConnect>,
}

impl SttConnectionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the interaction's session, creating it exactly once across
    /// concurrent callers.
    ///
    /// `connect` is entered by at most one caller per creation round; its
    /// result (success or failure) is distributed to every waiter.
    pub async fn get_or_connect(
        &self,
        interaction_id: &str,
        metrics: &AsrMetrics,
        connect: impl FnOnce() -> BoxFuture<'static, ConnectResult>,
    ) -> ConnectResult {
        if let Some(existing) = self.ready.get(interaction_id) {
            if !existing.is_closed() {
                metrics
                    .connections_reused
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Ok(Arc::clone(&existing));
            }
            // A closed handle that has not been removed yet: fall through to
            // creation, which replaces it.
            drop(existing);
            self.ready
                .remove_if(interaction_id, |_, session| session.is_closed());
        }

        // Register or join the in-flight creation. The entry guard is held
        // only while cloning/inserting the shared handle - never across an
        // await point.
        let (future, is_creator) = match self.pending.entry(interaction_id.to_string()) {
            Entry::Occupied(entry) => {
                metrics
                    .duplicate_connection_attempts
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                (entry.get().clone(), false)
            }
            Entry::Vacant(slot) => {
                let future = connect().shared();
                slot.insert(future.clone());
                (future, true)
            }
        };

        let result = future.await;

        if is_creator {
            // Publish before deregistering so a caller that misses the
            // pending entry finds the ready handle instead.
            if let Ok(session) = &result {
                self.ready
                    .insert(interaction_id.to_string(), Arc::clone(session));
            }
            self.pending.remove(interaction_id);
        }

        result
    }

    /// Removes and returns the interaction's session, if any.
    ///
    /// Called on provider error or explicit close so the next
    /// `get_or_connect` re-enters creation.
    pub fn remove(&self, interaction_id: &str) -> Option<Arc<SttSession>> {
        self.ready.remove(interaction_id).map(|(_, session)| session)
    }

    /// Removes the interaction's session only if it is the given handle.
    ///
    /// Used by per-session cleanup paths so a stale session's teardown can
    /// never evict a newer session that already replaced it.
    pub fn remove_matching(&self, interaction_id: &str, session: &Arc<SttSession>) -> bool {
        self.ready
            .remove_if(interaction_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Live session count (ready handles only).
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::{MockSttProvider, SttOpenRequest, SttProvider};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn connect_via(
        provider: &MockSttProvider,
        interaction_id: &str,
    ) -> BoxFuture<'static, ConnectResult> {
        let provider = provider.clone();
        let interaction_id = interaction_id.to_string();
        async move {
            let (tx, _rx) = tokio::sync::mpsc::channel(8);
            provider
                .open(SttOpenRequest {
                    interaction_id,
                    sample_rate: 8000,
                    events: tx,
                })
                .await
        }
        .boxed()
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_creation() {
        let map = Arc::new(SttConnectionMap::new());
        let metrics = Arc::new(AsrMetrics::default());
        let provider = MockSttProvider::new();
        provider.set_open_delay(Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let map = Arc::clone(&map);
            let metrics = Arc::clone(&metrics);
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                map.get_or_connect("call-2", &metrics, || connect_via(&provider, "call-2"))
                    .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        // Exactly one factory entry despite ten concurrent callers.
        assert_eq!(provider.opens_attempted(), 1);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn failure_empties_the_map_for_retry() {
        let map = SttConnectionMap::new();
        let metrics = AsrMetrics::default();
        let provider = MockSttProvider::new();
        provider.fail_next_opens(1);

        let first = map
            .get_or_connect("call-1", &metrics, || connect_via(&provider, "call-1"))
            .await;
        assert!(first.is_err());
        assert!(map.is_empty());

        let second = map
            .get_or_connect("call-1", &metrics, || connect_via(&provider, "call-1"))
            .await;
        assert!(second.is_ok());
        assert_eq!(provider.opens_attempted(), 2);
    }

    #[tokio::test]
    async fn sequential_callers_reuse_the_session() {
        let map = SttConnectionMap::new();
        let metrics = AsrMetrics::default();
        let provider = MockSttProvider::new();

        let first = map
            .get_or_connect("call-1", &metrics, || connect_via(&provider, "call-1"))
            .await
            .unwrap();
        let second = map
            .get_or_connect("call-1", &metrics, || connect_via(&provider, "call-1"))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.opens_attempted(), 1);
        assert_eq!(metrics.connections_reused.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn removed_session_triggers_fresh_creation() {
        let map = SttConnectionMap::new();
        let metrics = AsrMetrics::default();
        let provider = MockSttProvider::new();

        let first = map
            .get_or_connect("call-1", &metrics, || connect_via(&provider, "call-1"))
            .await
            .unwrap();
        let removed = map.remove("call-1").unwrap();
        assert!(Arc::ptr_eq(&first, &removed));

        let second = map
            .get_or_connect("call-1", &metrics, || connect_via(&provider, "call-1"))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(provider.opens_attempted(), 2);
    }
}
