//! Telephony connection tracking and management.
//!
//! Tracks active ingest WebSocket connections with force-close capability:
//!
//! - `IngestConnectionManager`: tracks all active connections
//! - `ConnectionGuard`: RAII guard for automatic cleanup on disconnect

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::metrics::IngestMetrics;

/// Internal connection state (placeholder for future metadata).
struct ConnectionState {}

/// Manages all active telephony WebSocket connections.
///
/// Thread-safe and designed for concurrent access from multiple socket
/// handlers. Uses hierarchical cancellation tokens for efficient
/// force-close of all connections on shutdown.
pub struct IngestConnectionManager {
    /// Active connections: connection_id -> ConnectionState
    connections: DashMap<String, ConnectionState>,
    /// Counter for generating unique connection IDs.
    next_id: AtomicU64,
    /// Global cancellation token - when cancelled, all connections close.
    /// Wrapped in RwLock so it can be replaced after close_all().
    global_cancel: RwLock<CancellationToken>,
}

impl IngestConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new connection and returns a guard for RAII cleanup.
    pub fn register(self: &Arc<Self>, metrics: Arc<IngestMetrics>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("tel-{id}");
        let cancel_token = self.global_cancel.read().child_token();

        self.connections.insert(conn_id.clone(), ConnectionState {});
        metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "[Ingest] Connection registered: {} (total: {})",
            conn_id,
            self.connections.len()
        );

        ConnectionGuard {
            id: conn_id,
            manager: Arc::clone(self),
            cancel_token,
            metrics,
        }
    }

    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::info!(
                "[Ingest] Connection unregistered: {} (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    /// Returns the number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Force-closes all connections. Returns how many were signaled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[Ingest] Force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for IngestConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a connection when dropped.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<IngestConnectionManager>,
    cancel_token: CancellationToken,
    metrics: Arc<IngestMetrics>,
}

impl ConnectionGuard {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the manager force-closes connections.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.manager.unregister(&self.id);
    }
}
