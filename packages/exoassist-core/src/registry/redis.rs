//! Redis-backed call registry for multi-process deployments.
//!
//! Layout:
//! - `exo:call:{id}` - JSON entry with an `EXPIRE` equal to the TTL,
//!   refreshed on every touch
//! - `exo:calls:active` - sorted set of active ids scored by
//!   `last_activity_at`, used by `list_active`
//!
//! Stale sorted-set members (expired hash gone) are pruned lazily during
//! listing.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CallRegistry, CallRegistryEntry, CallStatus};
use crate::error::{AssistError, AssistResult};

const ACTIVE_INDEX: &str = "exo:calls:active";

fn call_key(interaction_id: &str) -> String {
    format!("exo:call:{interaction_id}")
}

/// Registry stored in Redis with native TTLs.
pub struct RedisRegistry {
    manager: ConnectionManager,
    ttl: Duration,
}

impl RedisRegistry {
    pub async fn connect(url: &str, ttl: Duration) -> AssistResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AssistError::Configuration(format!("redis registry: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AssistError::Configuration(format!("redis registry: {e}")))?;
        Ok(Self { manager, ttl })
    }

    async fn write_entry(&self, entry: &CallRegistryEntry) -> AssistResult<()> {
        let json = serde_json::to_string(entry)
            .map_err(|e| AssistError::Internal(format!("registry encode: {e}")))?;
        let mut conn = self.manager.clone();
        let () = conn
            .set_ex(call_key(&entry.interaction_id), json, self.ttl.as_secs())
            .await
            .map_err(|e| AssistError::Internal(format!("registry write: {e}")))?;
        Ok(())
    }

    async fn read_entry(&self, interaction_id: &str) -> AssistResult<Option<CallRegistryEntry>> {
        let mut conn = self.manager.clone();
        let json: Option<String> = conn
            .get(call_key(interaction_id))
            .await
            .map_err(|e| AssistError::Internal(format!("registry read: {e}")))?;
        match json {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| AssistError::Internal(format!("registry decode: {e}"))),
        }
    }
}

#[async_trait]
impl CallRegistry for RedisRegistry {
    async fn register(&self, entry: CallRegistryEntry) -> AssistResult<()> {
        self.write_entry(&entry).await?;
        let mut conn = self.manager.clone();
        let _: u64 = conn
            .zadd(
                ACTIVE_INDEX,
                &entry.interaction_id,
                entry.last_activity_at,
            )
            .await
            .map_err(|e| AssistError::Internal(format!("registry index: {e}")))?;
        Ok(())
    }

    async fn touch(&self, interaction_id: &str) -> AssistResult<()> {
        let Some(mut entry) = self.read_entry(interaction_id).await? else {
            return Ok(());
        };
        entry.last_activity_at = crate::utils::now_millis();
        self.write_entry(&entry).await?;

        if entry.status == CallStatus::Active {
            let mut conn = self.manager.clone();
            let _: u64 = conn
                .zadd(ACTIVE_INDEX, interaction_id, entry.last_activity_at)
                .await
                .map_err(|e| AssistError::Internal(format!("registry index: {e}")))?;
        }
        Ok(())
    }

    async fn mark_ended(&self, interaction_id: &str) -> AssistResult<()> {
        let Some(mut entry) = self.read_entry(interaction_id).await? else {
            return Ok(());
        };
        entry.status = CallStatus::Ended;
        entry.last_activity_at = crate::utils::now_millis();
        self.write_entry(&entry).await?;

        let mut conn = self.manager.clone();
        let _: u64 = conn
            .zrem(ACTIVE_INDEX, interaction_id)
            .await
            .map_err(|e| AssistError::Internal(format!("registry index: {e}")))?;
        Ok(())
    }

    async fn get(&self, interaction_id: &str) -> AssistResult<Option<CallRegistryEntry>> {
        self.read_entry(interaction_id).await
    }

    async fn list_active(&self, limit: usize) -> AssistResult<Vec<CallRegistryEntry>> {
        let mut conn = self.manager.clone();
        // Over-fetch slightly so lazily-pruned stale members don't shrink
        // the page below the requested limit.
        let fetch = limit.saturating_mul(2).max(limit);
        let ids: Vec<String> = conn
            .zrevrange(ACTIVE_INDEX, 0, fetch as isize - 1)
            .await
            .map_err(|e| AssistError::Internal(format!("registry index: {e}")))?;

        let mut entries = Vec::with_capacity(limit);
        for id in ids {
            if entries.len() >= limit {
                break;
            }
            match self.read_entry(&id).await? {
                Some(entry) if entry.status == CallStatus::Active => entries.push(entry),
                Some(_) | None => {
                    // Hash expired or call ended: prune the index member.
                    let _: u64 = conn
                        .zrem(ACTIVE_INDEX, &id)
                        .await
                        .map_err(|e| AssistError::Internal(format!("registry index: {e}")))?;
                }
            }
        }
        Ok(entries)
    }
}
