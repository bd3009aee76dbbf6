//! WebSocket STT provider client.
//!
//! Per-connection setup: mint a single-use short-lived token over HTTPS,
//! open the WebSocket with that token, wait for the `session.started`
//! event, then stream raw PCM16 binary frames. A zero-length binary frame
//! every 3 seconds keeps idle sessions alive. Transcripts arrive as JSON
//! events with `text`, `type` (partial|final), optional `speaker` and
//! `confidence`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{SessionCommand, SttError, SttEvent, SttOpenRequest, SttProvider, SttSession};
use crate::protocol_constants::STT_KEEPALIVE_INTERVAL_SECS;
use crate::types::TranscriptKind;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Deserialize)]
struct TokenReply {
    token: String,
}

/// Wire shape of provider events.
#[derive(Deserialize)]
struct ProviderEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Streaming STT over WebSocket.
pub struct WsSttProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    connect_timeout: Duration,
}

impl WsSttProvider {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            connect_timeout,
        }
    }

    /// Mints a single-use session token.
    async fn mint_token(&self) -> Result<String, SttError> {
        let response = self
            .http
            .post(format!("{}/v1/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| SttError::Token(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SttError::Token(format!("status {}", response.status())));
        }

        let reply: TokenReply = response
            .json()
            .await
            .map_err(|e| SttError::Token(e.to_string()))?;
        Ok(reply.token)
    }

    /// Derives the WebSocket endpoint from the HTTPS base URL.
    fn stream_url(&self, token: &str, sample_rate: u32) -> String {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{ws_base}/v1/stream?token={token}&encoding=pcm16&sample_rate={sample_rate}&channels=1"
        )
    }

    /// Waits for the `session.started` handshake event.
    async fn await_session_started(ws: &mut WsStream) -> Result<(), SttError> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let event: ProviderEvent = serde_json::from_str(&text)
                        .map_err(|e| SttError::Handshake(e.to_string()))?;
                    if event.event_type == "session.started" {
                        return Ok(());
                    }
                    // Providers may interleave housekeeping events first.
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => {
                    return Err(SttError::Handshake(format!(
                        "unexpected frame before session.started: {other:?}"
                    )));
                }
                Some(Err(e)) => return Err(SttError::Handshake(e.to_string())),
                None => return Err(SttError::Handshake("closed during handshake".into())),
            }
        }
    }

    /// Writer side: audio commands plus idle keepalives.
    async fn run_writer(
        mut sink: futures::stream::SplitSink<WsStream, Message>,
        mut commands: mpsc::Receiver<SessionCommand>,
        closed: CancellationToken,
        interaction_id: String,
    ) {
        let mut keepalive =
            tokio::time::interval(Duration::from_secs(STT_KEEPALIVE_INTERVAL_SECS));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut audio_since_tick = false;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Audio(chunk)) => {
                        audio_since_tick = true;
                        if let Err(e) = sink.send(Message::Binary(chunk.to_vec().into())).await {
                            log::warn!("[STT] {} audio send failed: {}", interaction_id, e);
                            closed.cancel();
                            break;
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = keepalive.tick() => {
                    // Zero-length control frame holds the session open when
                    // no audio is flowing.
                    if !audio_since_tick {
                        if let Err(e) = sink.send(Message::Binary(Vec::new().into())).await {
                            log::debug!("[STT] {} keepalive failed: {}", interaction_id, e);
                            closed.cancel();
                            break;
                        }
                    }
                    audio_since_tick = false;
                }
                _ = closed.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    /// Reader side: transcript events forwarded to the worker.
    async fn run_reader(
        mut stream: futures::stream::SplitStream<WsStream>,
        events: mpsc::Sender<SttEvent>,
        closed: CancellationToken,
        interaction_id: String,
    ) {
        let reason = loop {
            tokio::select! {
                _ = closed.cancelled() => break "closed by worker".to_string(),
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(event) = serde_json::from_str::<ProviderEvent>(&text) else {
                            log::debug!("[STT] {} undecodable event: {}", interaction_id, text);
                            continue;
                        };
                        let kind = match event.event_type.as_str() {
                            "partial" => TranscriptKind::Partial,
                            "final" => TranscriptKind::Final,
                            _ => continue,
                        };
                        let transcript = SttEvent::Transcript {
                            text: event.text.unwrap_or_default(),
                            kind,
                            speaker: event.speaker,
                            confidence: event.confidence,
                        };
                        if events.send(transcript).await.is_err() {
                            break "worker dropped event channel".to_string();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break format!("provider close: {frame:?}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "provider disconnected".to_string(),
                }
            }
        };

        closed.cancel();
        let _ = events.send(SttEvent::Closed { reason }).await;
    }
}

#[async_trait]
impl SttProvider for WsSttProvider {
    async fn open(&self, request: SttOpenRequest) -> Result<Arc<SttSession>, SttError> {
        let setup = async {
            let token = self.mint_token().await?;
            let url = self.stream_url(&token, request.sample_rate);

            let (mut ws, _response) = connect_async(&url)
                .await
                .map_err(|e| SttError::Connect(e.to_string()))?;

            Self::await_session_started(&mut ws).await?;
            Ok::<WsStream, SttError>(ws)
        };

        let ws = tokio::time::timeout(self.connect_timeout, setup)
            .await
            .map_err(|_| SttError::Connect("session setup timed out".into()))??;

        let (sink, stream) = ws.split();
        let (command_tx, command_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();

        tokio::spawn(Self::run_writer(
            sink,
            command_rx,
            closed.clone(),
            request.interaction_id.clone(),
        ));
        tokio::spawn(Self::run_reader(
            stream,
            request.events,
            closed.clone(),
            request.interaction_id.clone(),
        ));

        log::info!("[STT] Session opened for {}", request.interaction_id);
        Ok(Arc::new(SttSession::new(
            request.interaction_id,
            command_tx,
            closed,
        )))
    }
}
