//! Scripted in-process STT provider.
//!
//! Stands in for the real provider in tests and keyless development. Tests
//! can widen the connect race window with an artificial open delay, script
//! open failures, inject transcript events for an interaction, and inspect
//! how many sessions and chunks the worker produced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SessionCommand, SttError, SttEvent, SttOpenRequest, SttProvider, SttSession};
use crate::types::TranscriptKind;

#[derive(Default)]
struct MockInner {
    /// Incremented at factory entry, before any delay or failure script.
    opens_attempted: AtomicU64,
    opens_succeeded: AtomicU64,
    /// Fail this many upcoming opens.
    fail_next_opens: AtomicU64,
    /// Chunks received per interaction.
    chunks: DashMap<String, u64>,
    /// Live event channels per interaction, for test-driven injection.
    event_channels: DashMap<String, mpsc::Sender<SttEvent>>,
    open_delay_ms: AtomicU64,
}

/// Scripted provider for tests and development.
#[derive(Clone, Default)]
pub struct MockSttProvider {
    inner: Arc<MockInner>,
}

impl MockSttProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artificial delay to every open, widening race windows.
    pub fn set_open_delay(&self, delay: Duration) {
        self.inner
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes the next `n` opens fail with a connect error.
    pub fn fail_next_opens(&self, n: u64) {
        self.inner.fail_next_opens.store(n, Ordering::SeqCst);
    }

    /// Sessions whose factory was entered (the invariant counter).
    #[must_use]
    pub fn opens_attempted(&self) -> u64 {
        self.inner.opens_attempted.load(Ordering::SeqCst)
    }

    /// Sessions that opened successfully.
    #[must_use]
    pub fn opens_succeeded(&self) -> u64 {
        self.inner.opens_succeeded.load(Ordering::SeqCst)
    }

    /// Chunks the writer task consumed for one interaction.
    #[must_use]
    pub fn chunks_for(&self, interaction_id: &str) -> u64 {
        self.inner
            .chunks
            .get(interaction_id)
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Injects a transcript event as if the provider produced it.
    ///
    /// Returns false when no session is open for the interaction.
    pub async fn emit_transcript(
        &self,
        interaction_id: &str,
        text: &str,
        kind: TranscriptKind,
    ) -> bool {
        let Some(tx) = self
            .inner
            .event_channels
            .get(interaction_id)
            .map(|r| r.clone())
        else {
            return false;
        };
        tx.send(SttEvent::Transcript {
            text: text.to_string(),
            kind,
            speaker: None,
            confidence: Some(0.9),
        })
        .await
        .is_ok()
    }

    /// Simulates a provider-side disconnect for an interaction.
    pub async fn emit_closed(&self, interaction_id: &str, reason: &str) -> bool {
        let Some(tx) = self
            .inner
            .event_channels
            .remove(interaction_id)
            .map(|(_, tx)| tx)
        else {
            return false;
        };
        tx.send(SttEvent::Closed {
            reason: reason.to_string(),
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl SttProvider for MockSttProvider {
    async fn open(&self, request: SttOpenRequest) -> Result<Arc<SttSession>, SttError> {
        self.inner.opens_attempted.fetch_add(1, Ordering::SeqCst);

        let delay = self.inner.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let remaining = self.inner.fail_next_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .fail_next_opens
                .store(remaining - 1, Ordering::SeqCst);
            return Err(SttError::Connect("scripted open failure".into()));
        }

        self.inner.opens_succeeded.fetch_add(1, Ordering::SeqCst);
        self.inner
            .event_channels
            .insert(request.interaction_id.clone(), request.events);

        let (command_tx, mut command_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();

        let inner = Arc::clone(&self.inner);
        let interaction_id = request.interaction_id.clone();
        let task_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    SessionCommand::Audio(chunk) => {
                        if !chunk.is_empty() {
                            *inner.chunks.entry(interaction_id.clone()).or_insert(0) += 1;
                        }
                    }
                    SessionCommand::Close => break,
                }
            }
            task_closed.cancel();
            inner.event_channels.remove(&interaction_id);
        });

        Ok(Arc::new(SttSession::new(
            request.interaction_id,
            command_tx,
            closed,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn open_request(id: &str) -> (SttOpenRequest, mpsc::Receiver<SttEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (
            SttOpenRequest {
                interaction_id: id.to_string(),
                sample_rate: 8000,
                events: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn counts_opens_and_chunks() {
        let provider = MockSttProvider::new();
        let (request, _rx) = open_request("call-1");
        let session = provider.open(request).await.unwrap();

        session.send_audio(Bytes::from(vec![0u8; 320])).await.unwrap();
        session.send_audio(Bytes::from(vec![0u8; 320])).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(provider.opens_attempted(), 1);
        assert_eq!(provider.chunks_for("call-1"), 2);
    }

    #[tokio::test]
    async fn scripted_failures_consume_the_budget() {
        let provider = MockSttProvider::new();
        provider.fail_next_opens(1);

        let (request, _rx) = open_request("call-1");
        assert!(provider.open(request).await.is_err());

        let (request, _rx2) = open_request("call-1");
        assert!(provider.open(request).await.is_ok());
        assert_eq!(provider.opens_attempted(), 2);
        assert_eq!(provider.opens_succeeded(), 1);
    }

    #[tokio::test]
    async fn injected_transcripts_reach_the_event_channel() {
        let provider = MockSttProvider::new();
        let (request, mut rx) = open_request("call-1");
        let _session = provider.open(request).await.unwrap();

        assert!(
            provider
                .emit_transcript("call-1", "hello there", TranscriptKind::Final)
                .await
        );

        match rx.recv().await.unwrap() {
            SttEvent::Transcript { text, kind, .. } => {
                assert_eq!(text, "hello there");
                assert_eq!(kind, TranscriptKind::Final);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
