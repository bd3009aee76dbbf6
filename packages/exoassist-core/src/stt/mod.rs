//! Streaming speech-to-text provider seam.
//!
//! One [`SttSession`] per interaction: audio goes out as raw PCM16 binary
//! frames (never base64 re-encoded), transcript events come back over an
//! mpsc channel owned by the ASR worker. The WebSocket implementation
//! lives in [`ws`]; [`mock`] provides a scripted in-process provider for
//! tests and keyless development.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::TranscriptKind;

pub mod mock;
pub mod ws;

pub use mock::MockSttProvider;
pub use ws::WsSttProvider;

/// STT failure.
///
/// `Clone` because connection results are distributed to concurrent waiters
/// through a shared creation future.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SttError {
    #[error("token minting failed: {0}")]
    Token(String),
    #[error("stt connect failed: {0}")]
    Connect(String),
    #[error("stt handshake failed: {0}")]
    Handshake(String),
    #[error("stt send failed: {0}")]
    Send(String),
    #[error("stt session closed: {0}")]
    Closed(String),
}

/// Event delivered by a provider session.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// One transcript result (partial or final).
    Transcript {
        text: String,
        kind: TranscriptKind,
        speaker: Option<String>,
        confidence: Option<f32>,
    },
    /// The provider closed the session (idle, error, or explicit stop).
    Closed { reason: String },
}

/// Parameters for opening one session.
pub struct SttOpenRequest {
    pub interaction_id: String,
    pub sample_rate: u32,
    /// Sink for transcript and lifecycle events.
    pub events: mpsc::Sender<SttEvent>,
}

/// Opens streaming sessions against the provider.
#[async_trait]
pub trait SttProvider: Send + Sync {
    async fn open(&self, request: SttOpenRequest) -> Result<Arc<SttSession>, SttError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Command consumed by a session's writer task.
pub(crate) enum SessionCommand {
    Audio(Bytes),
    Close,
}

/// Handle to one live provider session.
///
/// Cheap to clone behind an `Arc`; the writer task owns the actual socket.
pub struct SttSession {
    interaction_id: String,
    commands: mpsc::Sender<SessionCommand>,
    closed: CancellationToken,
}

impl SttSession {
    pub(crate) fn new(
        interaction_id: String,
        commands: mpsc::Sender<SessionCommand>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            interaction_id,
            commands,
            closed,
        }
    }

    #[must_use]
    pub fn interaction_id(&self) -> &str {
        &self.interaction_id
    }

    /// Sends one chunk of raw PCM16 audio.
    pub async fn send_audio(&self, chunk: Bytes) -> Result<(), SttError> {
        if self.closed.is_cancelled() {
            return Err(SttError::Closed("session already closed".into()));
        }
        self.commands
            .send(SessionCommand::Audio(chunk))
            .await
            .map_err(|_| SttError::Closed("writer task gone".into()))
    }

    /// Requests a clean close. Idempotent.
    pub async fn close(&self) {
        if !self.closed.is_cancelled() {
            let _ = self.commands.send(SessionCommand::Close).await;
            self.closed.cancel();
        }
    }

    /// Marks the session closed without sending a frame (provider-side
    /// disconnect observed by the reader task).
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
