//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage
//!
//! Configuration problems (a real provider selected without credentials)
//! fail the process here, before any traffic is accepted.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::asr::AsrWorker;
use crate::bus::{create_bus, topics, MessageBus};
use crate::config::{Config, LlmProviderKind, RegistryBackend, SttProviderKind};
use crate::consumer::{IntentClassifier, TranscriptConsumer};
use crate::error::{AssistError, AssistResult};
use crate::fanout::FanoutHub;
use crate::ingest::{IngestConnectionManager, IngestService};
use crate::kb::{DatabaseKbAdapter, KbRouter, ServiceKbAdapter};
use crate::llm::{HttpLlm, LlmClient, MockLlm};
use crate::metrics::MetricsHub;
use crate::registry::{CallRegistry, MemoryRegistry, RedisRegistry};
use crate::store::{AssistStore, MemoryStore};
use crate::stt::{MockSttProvider, SttProvider, WsSttProvider};
use crate::summary::SummaryService;
use crate::tenant::{ConfigScope, MemoryConfigSource, TenantConfigService};

/// Timeout applied to the shared HTTP client (LLM, KB, token minting).
const HTTP_TIMEOUT_SECS: u64 = 15;

/// Container for all bootstrapped services.
///
/// This struct holds all the wired services created during bootstrap.
/// It's consumed by `AppState` to build the final application state.
impl std::fmt::Debug for BootstrappedServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrappedServices").finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct BootstrappedServices {
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<dyn CallRegistry>,
    pub store: Arc<dyn AssistStore>,
    pub ingest: Arc<IngestService>,
    pub asr: Arc<AsrWorker>,
    pub consumer: Arc<TranscriptConsumer>,
    pub hub: Arc<FanoutHub>,
    pub summary: Arc<SummaryService>,
    pub tenants: Arc<TenantConfigService>,
    pub metrics: Arc<MetricsHub>,
    pub config: Arc<Config>,
    /// Seedable database KB adapter (article loading is deployment glue).
    pub kb_database: Arc<DatabaseKbAdapter>,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Kept for the TTL sweep task when the in-memory registry is used.
    memory_registry: Option<Arc<MemoryRegistry>>,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    #[must_use]
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Starts the pipeline's background tasks: ASR subscriptions, the
    /// consumer's discovery loop and the registry TTL sweep.
    pub async fn start_background_tasks(&self) -> AssistResult<()> {
        let audio_topics: Vec<String> = if self.config.bus.shared_audio_topic {
            vec![topics::AUDIO_SHARED.to_string()]
        } else {
            self.config
                .bus
                .audio_tenants
                .iter()
                .map(|tenant| topics::audio(false, tenant))
                .collect()
        };
        if audio_topics.is_empty() {
            return Err(AssistError::Configuration(
                "per-tenant audio topics selected but bus.audio_tenants is empty".to_string(),
            ));
        }

        self.asr
            .start(&audio_topics)
            .await
            .map_err(|e| AssistError::Bus(e.to_string()))?;
        self.consumer
            .start()
            .await
            .map_err(|e| AssistError::Bus(e.to_string()))?;

        if let Some(registry) = &self.memory_registry {
            let registry = Arc::clone(registry);
            let cancel = self.cancel_token.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    let swept = registry.sweep_expired();
                    if swept > 0 {
                        log::debug!("[Bootstrap] Registry sweep removed {swept} call(s)");
                    }
                }
            });
        }

        log::info!("[Bootstrap] Background tasks started");
        Ok(())
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        // Signal cancellation to all background tasks
        self.cancel_token.cancel();

        // Stop accepting telephony traffic first
        let closed = self.ingest.manager.close_all();
        if closed > 0 {
            log::info!("[Bootstrap] Closed {} telephony connection(s)", closed);
        }

        // Drain the pipeline from the back forward
        self.consumer.shutdown().await;
        self.asr.shutdown().await;
        self.bus.close().await;

        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Creates the shared HTTP client for all outbound requests.
///
/// Using a shared client enables connection pooling for better performance.
/// This is created once during bootstrap and injected into services that
/// need it.
fn create_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .expect("Failed to create HTTP client")
}

/// Builds the STT provider the config selects, failing fast on missing
/// credentials.
fn create_stt_provider(
    config: &Config,
    http_client: &Client,
) -> AssistResult<Arc<dyn SttProvider>> {
    match config.stt.provider {
        SttProviderKind::Mock => Ok(Arc::new(MockSttProvider::new())),
        SttProviderKind::Websocket => {
            let Some(api_key) = &config.stt.api_key else {
                return Err(AssistError::Configuration(
                    "stt.provider=websocket requires EXO_STT_API_KEY".to_string(),
                ));
            };
            Ok(Arc::new(WsSttProvider::new(
                http_client.clone(),
                &config.stt.base_url,
                api_key,
                Duration::from_secs(config.stt.connect_timeout_s),
            )))
        }
    }
}

/// Builds the LLM client the config selects, failing fast on missing
/// credentials.
fn create_llm_client(config: &Config, http_client: &Client) -> AssistResult<Arc<dyn LlmClient>> {
    match config.llm.provider {
        LlmProviderKind::Mock => Ok(Arc::new(MockLlm::new())),
        LlmProviderKind::Http => {
            let Some(api_key) = &config.llm.api_key else {
                return Err(AssistError::Configuration(
                    "llm.provider=http requires EXO_LLM_API_KEY".to_string(),
                ));
            };
            Ok(Arc::new(HttpLlm::new(
                http_client.clone(),
                &config.llm.base_url,
                api_key,
            )))
        }
    }
}

/// Bootstraps all application services with their dependencies.
///
/// This is the composition root where all services are instantiated and
/// wired together. The wiring order matters - services are created in
/// dependency order:
///
/// 1. Shared infrastructure (HTTP client, bus, cancellation token)
/// 2. Stores (registry, write-through store, tenant config)
/// 3. External adapters (STT, LLM, KB)
/// 4. Pipeline services (fan-out, consumer, summary, ASR, ingest)
///
/// # Errors
///
/// Returns a configuration error when validation fails, a selected backing
/// is unreachable, or a real provider is selected without credentials.
pub async fn bootstrap_services(config: Config) -> AssistResult<BootstrappedServices> {
    config
        .validate()
        .map_err(AssistError::Configuration)?;
    let config = Arc::new(config);

    let http_client = create_http_client();
    let cancel_token = CancellationToken::new();
    let metrics = Arc::new(MetricsHub::default());

    let bus = create_bus(&config.bus).await?;

    let (registry, memory_registry): (Arc<dyn CallRegistry>, Option<Arc<MemoryRegistry>>) =
        match config.registry.backend {
            RegistryBackend::Memory => {
                let registry =
                    Arc::new(MemoryRegistry::new(Duration::from_secs(config.registry.ttl_s)));
                (Arc::clone(&registry) as Arc<dyn CallRegistry>, Some(registry))
            }
            RegistryBackend::Redis => {
                let registry = Arc::new(
                    RedisRegistry::connect(
                        &config.bus.redis_url,
                        Duration::from_secs(config.registry.ttl_s),
                    )
                    .await?,
                );
                (registry as Arc<dyn CallRegistry>, None)
            }
        };

    let store: Arc<dyn AssistStore> = Arc::new(MemoryStore::new());

    // Per-tenant runtime configuration with a baseline default scope.
    let config_source = Arc::new(MemoryConfigSource::new());
    config_source.put(
        ConfigScope::Default,
        serde_json::json!({
            "kb": {
                "provider": "database",
                "maxArticles": config.consumer.default_max_articles,
            }
        }),
    );
    let tenants = Arc::new(TenantConfigService::new(
        config_source,
        config.consumer.default_max_articles,
    ));

    // External adapters
    let stt_provider = create_stt_provider(&config, &http_client)?;
    let llm = create_llm_client(&config, &http_client)?;

    let kb_database = Arc::new(DatabaseKbAdapter::new());
    let kb_service = Arc::new(ServiceKbAdapter::new(
        http_client.clone(),
        &format!("{}/kb/search", config.llm.base_url),
        None,
    ));
    let kb = Arc::new(KbRouter::new(
        Arc::clone(&kb_database),
        kb_service,
        Arc::clone(&tenants),
        Arc::clone(&metrics.consumer),
    ));

    // Pipeline services
    let hub = Arc::new(FanoutHub::new(Arc::clone(&metrics.consumer)));
    let classifier = Arc::new(IntentClassifier::new(
        Arc::clone(&llm),
        config.llm.clone(),
    ));

    let consumer = Arc::new(TranscriptConsumer::new(
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&store),
        classifier,
        kb,
        Arc::clone(&hub),
        Arc::clone(&tenants),
        config.consumer.clone(),
        Arc::clone(&metrics.consumer),
    ));

    let summary = Arc::new(SummaryService::new(
        Arc::clone(&llm),
        Arc::clone(&store),
        Arc::clone(&tenants),
        config.llm.clone(),
        Arc::clone(&metrics.consumer),
    ));

    let asr = Arc::new(AsrWorker::new(
        Arc::clone(&bus),
        stt_provider,
        config.asr.clone(),
        Arc::clone(&metrics),
    ));

    let ingest = Arc::new(IngestService::new(
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        config.ingest.clone(),
        config.bus.shared_audio_topic,
        Arc::new(IngestConnectionManager::new()),
    ));

    Ok(BootstrappedServices {
        bus,
        registry,
        store,
        ingest,
        asr,
        consumer,
        hub,
        summary,
        tenants,
        metrics,
        config,
        kb_database,
        http_client,
        cancel_token,
        memory_registry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_config_bootstraps_with_mocks() {
        let services = bootstrap_services(Config::default()).await.unwrap();
        assert_eq!(services.ingest.manager.connection_count(), 0);
        assert_eq!(services.consumer.attached_calls(), 0);
    }

    #[tokio::test]
    async fn websocket_stt_without_key_fails_fast() {
        let mut config = Config::default();
        config.stt.provider = SttProviderKind::Websocket;
        config.stt.api_key = None;

        let err = bootstrap_services(config).await.unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[tokio::test]
    async fn http_llm_without_key_fails_fast() {
        let mut config = Config::default();
        config.llm.provider = LlmProviderKind::Http;
        config.llm.api_key = None;

        let err = bootstrap_services(config).await.unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[tokio::test]
    async fn per_tenant_audio_without_tenants_fails_at_task_start() {
        let mut config = Config::default();
        config.bus.shared_audio_topic = false;

        let services = bootstrap_services(config).await.unwrap();
        let err = services.start_background_tasks().await.unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }
}
