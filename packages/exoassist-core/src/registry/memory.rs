//! In-process call registry.
//!
//! Suitable for single-process deployments and tests. Expiry is enforced
//! lazily on reads plus a `sweep_expired` pass that bootstrap schedules
//! periodically.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CallRegistry, CallRegistryEntry, CallStatus};
use crate::error::AssistResult;

/// DashMap-backed registry with TTL.
pub struct MemoryRegistry {
    calls: DashMap<String, CallRegistryEntry>,
    ttl: Duration,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            calls: DashMap::new(),
            ttl,
        }
    }

    fn is_expired(&self, entry: &CallRegistryEntry) -> bool {
        let now = crate::utils::now_millis();
        now.saturating_sub(entry.last_activity_at) > self.ttl.as_millis() as u64
    }

    /// Removes expired entries. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let before = self.calls.len();
        let ttl_ms = self.ttl.as_millis() as u64;
        let now = crate::utils::now_millis();
        self.calls
            .retain(|_, entry| now.saturating_sub(entry.last_activity_at) <= ttl_ms);
        before - self.calls.len()
    }

    /// Number of live (unexpired) entries, active or ended.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[async_trait]
impl CallRegistry for MemoryRegistry {
    async fn register(&self, entry: CallRegistryEntry) -> AssistResult<()> {
        log::debug!(
            "[Registry] Registered call {} (tenant {})",
            entry.interaction_id,
            entry.tenant_id
        );
        self.calls.insert(entry.interaction_id.clone(), entry);
        Ok(())
    }

    async fn touch(&self, interaction_id: &str) -> AssistResult<()> {
        if let Some(mut entry) = self.calls.get_mut(interaction_id) {
            entry.last_activity_at = crate::utils::now_millis();
        }
        Ok(())
    }

    async fn mark_ended(&self, interaction_id: &str) -> AssistResult<()> {
        if let Some(mut entry) = self.calls.get_mut(interaction_id) {
            entry.status = CallStatus::Ended;
            entry.last_activity_at = crate::utils::now_millis();
            log::debug!("[Registry] Call {} ended", interaction_id);
        }
        Ok(())
    }

    async fn get(&self, interaction_id: &str) -> AssistResult<Option<CallRegistryEntry>> {
        let Some(entry) = self.calls.get(interaction_id) else {
            return Ok(None);
        };
        if self.is_expired(&entry) {
            return Ok(None);
        }
        Ok(Some(entry.clone()))
    }

    async fn list_active(&self, limit: usize) -> AssistResult<Vec<CallRegistryEntry>> {
        let mut active: Vec<CallRegistryEntry> = self
            .calls
            .iter()
            .filter(|r| r.status == CallStatus::Active && !self.is_expired(r.value()))
            .map(|r| r.value().clone())
            .collect();
        active.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        active.truncate(limit);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MemoryRegistry {
        MemoryRegistry::new(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn register_then_get() {
        let reg = registry();
        reg.register(CallRegistryEntry::new("call-1", "acme"))
            .await
            .unwrap();

        let entry = reg.get("call-1").await.unwrap().unwrap();
        assert_eq!(entry.tenant_id, "acme");
        assert_eq!(entry.status, CallStatus::Active);
    }

    #[tokio::test]
    async fn touch_is_idempotent_and_preserves_started_at() {
        let reg = registry();
        reg.register(CallRegistryEntry::new("call-1", "acme"))
            .await
            .unwrap();
        let started = reg.get("call-1").await.unwrap().unwrap().started_at;

        for _ in 0..5 {
            reg.touch("call-1").await.unwrap();
        }

        let entry = reg.get("call-1").await.unwrap().unwrap();
        assert_eq!(entry.started_at, started);
        assert!(entry.last_activity_at >= started);
    }

    #[tokio::test]
    async fn touch_unknown_id_is_noop() {
        let reg = registry();
        reg.touch("missing").await.unwrap();
        assert!(reg.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ended_calls_leave_active_listing() {
        let reg = registry();
        reg.register(CallRegistryEntry::new("call-1", "acme"))
            .await
            .unwrap();
        reg.register(CallRegistryEntry::new("call-2", "acme"))
            .await
            .unwrap();

        reg.mark_ended("call-1").await.unwrap();

        let active = reg.list_active(10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].interaction_id, "call-2");
    }

    #[tokio::test]
    async fn list_active_orders_by_recency_and_limits() {
        let reg = registry();
        for i in 0..3 {
            let mut entry = CallRegistryEntry::new(&format!("call-{i}"), "acme");
            entry.last_activity_at = 1000 + i;
            reg.calls.insert(entry.interaction_id.clone(), entry);
        }

        let active = reg.list_active(2).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].interaction_id, "call-2");
        assert_eq!(active[1].interaction_id, "call-1");
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_swept() {
        let reg = MemoryRegistry::new(Duration::from_millis(10));
        let mut entry = CallRegistryEntry::new("call-1", "acme");
        entry.last_activity_at = crate::utils::now_millis().saturating_sub(1000);
        reg.calls.insert(entry.interaction_id.clone(), entry);

        assert!(reg.get("call-1").await.unwrap().is_none());
        assert!(reg.list_active(10).await.unwrap().is_empty());
        assert_eq!(reg.sweep_expired(), 1);
        assert!(reg.is_empty());
    }
}
