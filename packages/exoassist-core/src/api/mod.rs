//! HTTP/WebSocket/SSE API layer.
//!
//! This module contains thin handlers that delegate to services.
//! It provides the router construction and server startup functionality.

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::consumer::TranscriptConsumer;
use crate::fanout::FanoutHub;
use crate::ingest::IngestService;
use crate::metrics::MetricsHub;
use crate::registry::CallRegistry;
use crate::store::AssistStore;
use crate::summary::SummaryService;

pub mod http;
pub mod sse;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to services.
/// All business logic lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Telephony ingest dependencies.
    pub ingest: Arc<IngestService>,
    /// Transcript consumer (cache + direct ingest path).
    pub consumer: Arc<TranscriptConsumer>,
    /// SSE client hub.
    pub hub: Arc<FanoutHub>,
    /// Active-call registry.
    pub registry: Arc<dyn CallRegistry>,
    /// Write-through store.
    pub store: Arc<dyn AssistStore>,
    /// End-of-call summary service.
    pub summary: Arc<SummaryService>,
    /// Component metrics for the health endpoint.
    pub metrics: Arc<MetricsHub>,
    /// Application configuration.
    pub config: Arc<Config>,
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    ingest: Option<Arc<IngestService>>,
    consumer: Option<Arc<TranscriptConsumer>>,
    hub: Option<Arc<FanoutHub>>,
    registry: Option<Arc<dyn CallRegistry>>,
    store: Option<Arc<dyn AssistStore>>,
    summary: Option<Arc<SummaryService>>,
    metrics: Option<Arc<MetricsHub>>,
    config: Option<Arc<Config>>,
}

impl AppStateBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates all shared service fields from a `BootstrappedServices`
    /// container, leaving nothing to set individually.
    #[must_use]
    pub fn from_services(mut self, services: &crate::BootstrappedServices) -> Self {
        self.ingest = Some(Arc::clone(&services.ingest));
        self.consumer = Some(Arc::clone(&services.consumer));
        self.hub = Some(Arc::clone(&services.hub));
        self.registry = Some(Arc::clone(&services.registry));
        self.store = Some(Arc::clone(&services.store));
        self.summary = Some(Arc::clone(&services.summary));
        self.metrics = Some(Arc::clone(&services.metrics));
        self.config = Some(Arc::clone(&services.config));
        self
    }

    pub fn ingest(mut self, ingest: Arc<IngestService>) -> Self {
        self.ingest = Some(ingest);
        self
    }

    pub fn consumer(mut self, consumer: Arc<TranscriptConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn hub(mut self, hub: Arc<FanoutHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn CallRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn AssistStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn summary(mut self, summary: Arc<SummaryService>) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsHub>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the `AppState`, panicking if required fields are missing.
    #[must_use]
    pub fn build(self) -> AppState {
        AppState {
            ingest: self.ingest.expect("ingest is required"),
            consumer: self.consumer.expect("consumer is required"),
            hub: self.hub.expect("hub is required"),
            registry: self.registry.expect("registry is required"),
            store: self.store.expect("store is required"),
            summary: self.summary.expect("summary is required"),
            metrics: self.metrics.expect("metrics is required"),
            config: self.config.expect("config is required"),
        }
    }
}

impl AppState {
    /// Creates a new builder for constructing an `AppState`.
    #[must_use]
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }
}

async fn find_available_port(
    start: u16,
    end: u16,
) -> Result<(u16, tokio::net::TcpListener), ServerError> {
    for port in start..=end {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Starts the HTTP server on the configured or auto-discovered port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let preferred_port = state.config.preferred_port;
    let (port, listener) = if preferred_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
        (preferred_port, tokio::net::TcpListener::bind(&addr).await?)
    } else {
        find_available_port(8750, 8760).await?
    };

    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
