//! Knowledge-base retrieval adapters.
//!
//! A narrow `search` interface with three implementations: direct-database
//! (LIKE-style scan), external-service (HTTPS with bearer token) and no-op.
//! Adapter selection is per tenant via the runtime config; adapter errors
//! always degrade to an empty article list at the router.

use async_trait::async_trait;
use thiserror::Error;

use crate::metrics::ConsumerMetrics;
use crate::tenant::{KbProviderKind, TenantConfigService};
use crate::types::KbArticle;

pub mod database;
pub mod noop;
pub mod service;

pub use database::DatabaseKbAdapter;
pub use noop::NoopKbAdapter;
pub use service::ServiceKbAdapter;

/// KB failure. The router converts every variant to an empty result.
#[derive(Debug, Error)]
pub enum KbError {
    #[error("kb request failed: {0}")]
    Http(String),
    #[error("kb request timed out")]
    Timeout,
    #[error("kb adapter unavailable: {0}")]
    Unavailable(String),
}

/// Scope for one KB query.
#[derive(Debug, Clone)]
pub struct SearchScope {
    pub tenant_id: String,
    /// Maximum articles to return.
    pub max: usize,
    /// Optional extra context (recent transcript text).
    pub context: Option<String>,
}

/// Narrow retrieval interface every adapter implements.
#[async_trait]
pub trait KbAdapter: Send + Sync {
    /// Adapter name, recorded on each returned article as `source`.
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, scope: &SearchScope)
        -> Result<Vec<KbArticle>, KbError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Routes KB lookups to the adapter a tenant's config selects.
pub struct KbRouter {
    database: std::sync::Arc<DatabaseKbAdapter>,
    service: std::sync::Arc<ServiceKbAdapter>,
    noop: std::sync::Arc<NoopKbAdapter>,
    tenants: std::sync::Arc<TenantConfigService>,
    metrics: std::sync::Arc<ConsumerMetrics>,
}

impl KbRouter {
    #[must_use]
    pub fn new(
        database: std::sync::Arc<DatabaseKbAdapter>,
        service: std::sync::Arc<ServiceKbAdapter>,
        tenants: std::sync::Arc<TenantConfigService>,
        metrics: std::sync::Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            database,
            service,
            noop: std::sync::Arc::new(NoopKbAdapter),
            tenants,
            metrics,
        }
    }

    /// Looks up articles for a tenant, degrading to empty on any failure.
    pub async fn lookup(&self, tenant_id: &str, query: &str, context: Option<String>) -> Vec<KbArticle> {
        let settings = self.tenants.settings(tenant_id).await;
        let adapter: &dyn KbAdapter = match settings.kb_provider {
            KbProviderKind::Database => self.database.as_ref(),
            KbProviderKind::Service => self.service.as_ref(),
            KbProviderKind::None => self.noop.as_ref(),
        };

        let scope = SearchScope {
            tenant_id: tenant_id.to_string(),
            max: settings.max_articles,
            context,
        };

        match adapter.search(query, &scope).await {
            Ok(articles) => articles,
            Err(e) => {
                self.metrics
                    .kb_failures
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                log::warn!(
                    "[KB] {} lookup failed for tenant {}: {}",
                    adapter.name(),
                    tenant_id,
                    e
                );
                Vec::new()
            }
        }
    }
}
