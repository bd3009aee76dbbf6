//! Per-tenant runtime configuration.
//!
//! Runtime behaviour (KB provider, article counts, LLM models, disposition
//! taxonomy) is controlled by a layered config document with deep-merge
//! semantics: default → global → tenant → campaign → agent. Merged results
//! are cached for a short TTL so the hot path never waits on the source.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cache TTL for merged configs. Edits become visible within this window.
pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(5);

/// One scope in the merge chain, from widest to narrowest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigScope {
    Default,
    Global,
    Tenant(String),
    Campaign(String),
    Agent(String),
}

impl ConfigScope {
    /// Storage key for this scope.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Default => "default".to_string(),
            Self::Global => "global".to_string(),
            Self::Tenant(id) => format!("tenant:{id}"),
            Self::Campaign(id) => format!("campaign:{id}"),
            Self::Agent(id) => format!("agent:{id}"),
        }
    }
}

/// Source of raw per-scope config documents.
///
/// The admin surface that edits these lives outside the core; the pipeline
/// only reads.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Returns the raw document for one scope, if any.
    async fn load_scope(&self, scope: &ConfigScope) -> Option<Value>;
}

/// In-memory config source for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryConfigSource {
    scopes: DashMap<String, Value>,
}

impl MemoryConfigSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes one scope document.
    pub fn put(&self, scope: ConfigScope, value: Value) {
        self.scopes.insert(scope.key(), value);
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn load_scope(&self, scope: &ConfigScope) -> Option<Value> {
        self.scopes.get(&scope.key()).map(|v| v.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deep Merge
// ─────────────────────────────────────────────────────────────────────────────

/// Recursively merges `overlay` into `base`.
///
/// Objects merge key-by-key; every other value type (including arrays)
/// replaces the base wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed Settings View
// ─────────────────────────────────────────────────────────────────────────────

/// Which KB adapter serves a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KbProviderKind {
    /// Direct-database adapter (LIKE over title/snippet/tags).
    #[default]
    Database,
    /// External HTTPS service with bearer token.
    Service,
    /// Always-empty adapter.
    None,
}

/// One entry of a tenant's disposition taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispositionTaxonomyEntry {
    pub id: String,
    pub code: String,
    pub title: String,
}

/// Typed view over the merged config document.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub kb_provider: KbProviderKind,
    pub max_articles: usize,
    pub kb_timeout_ms: u64,
    pub intent_model: Option<String>,
    pub summary_model: Option<String>,
    pub dispositions: Vec<DispositionTaxonomyEntry>,
}

impl TenantSettings {
    /// Extracts the typed view, filling gaps with pipeline defaults.
    #[must_use]
    pub fn from_value(merged: &Value, default_max_articles: usize) -> Self {
        let kb = merged.get("kb");
        let llm = merged.get("llm");

        let kb_provider = kb
            .and_then(|v| v.get("provider"))
            .and_then(Value::as_str)
            .and_then(|s| match s {
                "database" => Some(KbProviderKind::Database),
                "service" => Some(KbProviderKind::Service),
                "none" => Some(KbProviderKind::None),
                _ => None,
            })
            .unwrap_or_default();

        let max_articles = kb
            .and_then(|v| v.get("maxArticles"))
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(default_max_articles);

        let kb_timeout_ms = kb
            .and_then(|v| v.get("timeoutMs"))
            .and_then(Value::as_u64)
            .unwrap_or(crate::protocol_constants::KB_SERVICE_TIMEOUT_SECS * 1000);

        let dispositions = merged
            .get("dispositions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Self {
            kb_provider,
            max_articles,
            kb_timeout_ms,
            intent_model: llm
                .and_then(|v| v.get("intentModel"))
                .and_then(Value::as_str)
                .map(str::to_string),
            summary_model: llm
                .and_then(|v| v.get("summaryModel"))
                .and_then(Value::as_str)
                .map(str::to_string),
            dispositions,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

struct CachedConfig {
    merged: Value,
    fetched_at: Instant,
}

/// Merges and caches per-tenant configuration.
pub struct TenantConfigService {
    source: std::sync::Arc<dyn ConfigSource>,
    cache: DashMap<String, CachedConfig>,
    cache_ttl: Duration,
    default_max_articles: usize,
}

impl TenantConfigService {
    #[must_use]
    pub fn new(source: std::sync::Arc<dyn ConfigSource>, default_max_articles: usize) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            cache_ttl: CONFIG_CACHE_TTL,
            default_max_articles,
        }
    }

    /// Returns the merged config for a tenant (and optionally a campaign and
    /// agent scope beneath it).
    pub async fn effective(
        &self,
        tenant_id: &str,
        campaign_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> Value {
        let cache_key = format!(
            "{tenant_id}|{}|{}",
            campaign_id.unwrap_or(""),
            agent_id.unwrap_or("")
        );

        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return cached.merged.clone();
            }
        }

        let mut chain = vec![ConfigScope::Default, ConfigScope::Global];
        chain.push(ConfigScope::Tenant(tenant_id.to_string()));
        if let Some(campaign) = campaign_id {
            chain.push(ConfigScope::Campaign(campaign.to_string()));
        }
        if let Some(agent) = agent_id {
            chain.push(ConfigScope::Agent(agent.to_string()));
        }

        let mut merged = Value::Object(serde_json::Map::new());
        for scope in &chain {
            if let Some(layer) = self.source.load_scope(scope).await {
                deep_merge(&mut merged, &layer);
            }
        }

        self.cache.insert(
            cache_key,
            CachedConfig {
                merged: merged.clone(),
                fetched_at: Instant::now(),
            },
        );
        merged
    }

    /// Typed settings for a tenant.
    pub async fn settings(&self, tenant_id: &str) -> TenantSettings {
        let merged = self.effective(tenant_id, None, None).await;
        TenantSettings::from_value(&merged, self.default_max_articles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn deep_merge_overrides_leaves_and_keeps_siblings() {
        let mut base = json!({"kb": {"timeoutMs": 5000, "maxArticles": 3}});
        let overlay = json!({"kb": {"maxArticles": 5}});
        deep_merge(&mut base, &overlay);

        assert_eq!(base["kb"]["timeoutMs"], 5000);
        assert_eq!(base["kb"]["maxArticles"], 5);
    }

    #[test]
    fn deep_merge_replaces_arrays_wholesale() {
        let mut base = json!({"dispositions": [{"id": "1"}]});
        let overlay = json!({"dispositions": []});
        deep_merge(&mut base, &overlay);
        assert_eq!(base["dispositions"], json!([]));
    }

    #[tokio::test]
    async fn tenant_layer_wins_over_global_where_set() {
        let source = Arc::new(MemoryConfigSource::new());
        source.put(
            ConfigScope::Global,
            json!({"kb": {"timeoutMs": 5000, "maxArticles": 3}}),
        );
        source.put(
            ConfigScope::Tenant("acme".into()),
            json!({"kb": {"maxArticles": 7}}),
        );

        let service = TenantConfigService::new(source, 3);
        let merged = service.effective("acme", None, None).await;

        // Tenant omitted kb.timeoutMs: global value survives the merge.
        assert_eq!(merged["kb"]["timeoutMs"], 5000);
        assert_eq!(merged["kb"]["maxArticles"], 7);
    }

    #[tokio::test]
    async fn agent_scope_is_narrowest() {
        let source = Arc::new(MemoryConfigSource::new());
        source.put(ConfigScope::Global, json!({"llm": {"intentModel": "a"}}));
        source.put(
            ConfigScope::Agent("agent-1".into()),
            json!({"llm": {"intentModel": "b"}}),
        );

        let service = TenantConfigService::new(source, 3);
        let merged = service.effective("acme", None, Some("agent-1")).await;
        assert_eq!(merged["llm"]["intentModel"], "b");
    }

    #[tokio::test]
    async fn cache_serves_stale_until_ttl() {
        let source = Arc::new(MemoryConfigSource::new());
        source.put(ConfigScope::Global, json!({"kb": {"maxArticles": 1}}));

        let service = TenantConfigService::new(source.clone(), 3);
        assert_eq!(
            service.effective("acme", None, None).await["kb"]["maxArticles"],
            1
        );

        // Edit lands but the cached merge is still fresh.
        source.put(ConfigScope::Global, json!({"kb": {"maxArticles": 9}}));
        assert_eq!(
            service.effective("acme", None, None).await["kb"]["maxArticles"],
            1
        );
    }

    #[tokio::test]
    async fn settings_fill_defaults() {
        let source = Arc::new(MemoryConfigSource::new());
        let service = TenantConfigService::new(source, 3);
        let settings = service.settings("acme").await;

        assert_eq!(settings.kb_provider, KbProviderKind::Database);
        assert_eq!(settings.max_articles, 3);
        assert!(settings.dispositions.is_empty());
    }
}
