//! Telephony ingest.
//!
//! Terminates the provider's WebSocket, decodes audio payloads, publishes
//! ordered frames to the bus and registers the call:
//!
//! - [`ws`]: the framed JSON protocol and per-connection loop
//! - [`publisher`]: publish-with-fallback bounded buffering
//! - [`connection`]: connection tracking with force-close

use serde::{Deserialize, Serialize};

pub mod auth;
pub mod connection;
pub mod publisher;
pub mod ws;

pub use auth::{AllowAllPolicy, AuthContext, IngestAuthPolicy, TokenAllowListPolicy};
pub use connection::{ConnectionGuard, IngestConnectionManager};
pub use publisher::{FallbackPublisher, PublishOutcome};
pub use ws::{handle_telephony_socket, IngestConnection, IngestService};

/// Event published on the shared `call_end` topic when a call tears down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnd {
    pub interaction_id: String,
    pub tenant_id: String,
    /// `stopped` or `callended` from the provider; `stopped` when
    /// synthesized by the idle watchdog or transport loss.
    pub reason: String,
}
