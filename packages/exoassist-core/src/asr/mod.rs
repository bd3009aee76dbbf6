//! Streaming ASR worker.
//!
//! Turns continuous audio frames from many concurrent interactions into
//! transcripts, maintaining exactly one streaming STT connection per
//! interaction:
//!
//! - [`connection`]: the per-interaction creation promise map
//! - [`interaction`]: per-interaction buffer, sequencing and filtering
//! - [`worker`]: the bus-facing worker tying it together

pub mod connection;
pub mod interaction;
pub mod worker;

pub use connection::SttConnectionMap;
pub use interaction::InteractionState;
pub use worker::AsrWorker;

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::bus::memory::MemoryBus;
    use crate::bus::{topics, BusHandler, BusMessage, MessageBus};
    use crate::config::AsrConfig;
    use crate::metrics::MetricsHub;
    use crate::stt::MockSttProvider;
    use crate::types::{pcm16_encoding, AudioFrame, Transcript, TranscriptKind};

    use super::AsrWorker;

    fn frame(interaction_id: &str, seq: u64) -> AudioFrame {
        AudioFrame {
            tenant_id: "acme".into(),
            interaction_id: interaction_id.into(),
            seq,
            timestamp_ms: seq * 20,
            sample_rate: 8000,
            encoding: pcm16_encoding(),
            // Loud enough to clear the silence gate.
            audio: Bytes::from(
                (0..160)
                    .flat_map(|i| {
                        let sample: i16 = if i % 2 == 0 { 12000 } else { -12000 };
                        sample.to_le_bytes()
                    })
                    .collect::<Vec<u8>>(),
            ),
            trace_id: None,
        }
    }

    fn worker(provider: &MockSttProvider) -> (Arc<AsrWorker>, Arc<MemoryBus>, Arc<MetricsHub>) {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(MetricsHub::default());
        let worker = Arc::new(AsrWorker::new(
            bus.clone(),
            Arc::new(provider.clone()),
            AsrConfig::default(),
            metrics.clone(),
        ));
        (worker, bus, metrics)
    }

    /// Collects transcripts published to one topic.
    struct Collect {
        seen: parking_lot::Mutex<Vec<Transcript>>,
    }

    #[async_trait::async_trait]
    impl BusHandler for Collect {
        async fn handle(&self, msg: BusMessage) -> Result<(), crate::bus::BusError> {
            self.seen.lock().push(msg.envelope.decode()?);
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_frames_create_exactly_one_connection() {
        let provider = MockSttProvider::new();
        provider.set_open_delay(Duration::from_millis(30));
        let (worker, _bus, metrics) = worker(&provider);

        let mut handles = Vec::new();
        for seq in 1..=10 {
            let worker = Arc::clone(&worker);
            handles.push(tokio::spawn(async move {
                worker.handle_frame(frame("call-2", seq)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(provider.opens_attempted(), 1);
        assert_eq!(
            metrics.asr.connections_created.load(Ordering::Relaxed),
            1
        );
        assert_eq!(worker.interaction_count(), 1);
    }

    #[tokio::test]
    async fn transcripts_get_monotonic_seq_and_publish() {
        let provider = MockSttProvider::new();
        let (worker, bus, _metrics) = worker(&provider);

        let collector = Arc::new(Collect {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        bus.subscribe(&topics::transcript("call-1"), "test", collector.clone())
            .await
            .unwrap();

        worker.handle_frame(frame("call-1", 1)).await;
        // Disengage the early filter with real speech.
        provider
            .emit_transcript("call-1", "I need to reset my password", TranscriptKind::Partial)
            .await;
        provider
            .emit_transcript("call-1", "I need to reset my password please", TranscriptKind::Final)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = collector.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].seq, 1);
        assert_eq!(seen[1].seq, 2);
        assert!(seen.iter().all(|t| !t.text.trim().is_empty()));
    }

    #[tokio::test]
    async fn early_filter_suppresses_filler_until_speech() {
        let provider = MockSttProvider::new();
        let (worker, bus, _metrics) = worker(&provider);

        let collector = Arc::new(Collect {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        bus.subscribe(&topics::transcript("call-4"), "test", collector.clone())
            .await
            .unwrap();

        worker.handle_frame(frame("call-4", 1)).await;

        // Empty transcripts during silence never publish.
        provider.emit_transcript("call-4", "", TranscriptKind::Partial).await;
        // Filler inside the early window is suppressed.
        provider.emit_transcript("call-4", "um", TranscriptKind::Partial).await;
        // Real speech publishes and disengages the filter.
        provider
            .emit_transcript("call-4", "I need to reset my password", TranscriptKind::Final)
            .await;
        // Subsequent filler now passes.
        provider.emit_transcript("call-4", "uh", TranscriptKind::Partial).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let texts: Vec<String> = collector.seen.lock().iter().map(|t| t.text.clone()).collect();
        assert_eq!(texts, vec!["I need to reset my password", "uh"]);
    }

    #[tokio::test]
    async fn open_failure_drops_frame_and_retries_after_cooldown() {
        let provider = MockSttProvider::new();
        provider.fail_next_opens(1);
        let (worker, _bus, _metrics) = worker(&provider);

        worker.handle_frame(frame("call-1", 1)).await;
        assert_eq!(provider.opens_succeeded(), 0);

        // Within the cool-down the frame is dropped without a retry.
        worker.handle_frame(frame("call-1", 2)).await;
        assert_eq!(provider.opens_attempted(), 1);

        // After the cool-down the next frame reconnects.
        tokio::time::sleep(Duration::from_millis(
            AsrConfig::default().reconnect_cooldown_ms + 50,
        ))
        .await;
        worker.handle_frame(frame("call-1", 3)).await;
        assert_eq!(provider.opens_succeeded(), 1);
    }

    #[tokio::test]
    async fn sample_rate_change_closes_the_interaction() {
        let provider = MockSttProvider::new();
        let (worker, _bus, _metrics) = worker(&provider);

        worker.handle_frame(frame("call-1", 1)).await;
        assert_eq!(worker.interaction_count(), 1);

        let mut changed = frame("call-1", 2);
        changed.sample_rate = 16000;
        worker.handle_frame(changed).await;
        assert_eq!(worker.interaction_count(), 0);
    }

    #[tokio::test]
    async fn warmup_sends_one_chunk_after_500ms_of_audio() {
        let provider = MockSttProvider::new();
        let (worker, _bus, metrics) = worker(&provider);

        // 25 frames x 20 ms = 500 ms: exactly one warm-up chunk.
        for seq in 1..=25 {
            worker.handle_frame(frame("call-1", seq)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(provider.chunks_for("call-1"), 1);
        assert_eq!(metrics.asr.chunks_sent.load(Ordering::Relaxed), 1);
    }
}
