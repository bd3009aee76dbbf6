//! HTTP routes consumed by the dashboard, plus the telephony WS upgrade.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{sse, AppState};
use crate::error::{AssistError, AssistResult};
use crate::ingest::{handle_telephony_socket, AuthContext};
use crate::protocol_constants::SERVICE_ID;
use crate::store::DispositionRow;
use crate::types::{Speaker, Transcript, TranscriptKind};

/// Builds the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/events/stream", get(sse::event_stream))
        .route("/calls/ingest-transcript", post(ingest_transcript))
        .route("/calls/active", get(active_calls))
        .route("/calls/{id}/transcript", get(call_transcript))
        .route("/calls/summary", post(call_summary))
        .route("/calls/{id}/disposition", post(save_disposition));

    // The telephony bridge can be disabled per deployment.
    if state.config.ingest.bridge_enabled {
        router = router.route("/ws", get(telephony_ws));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
        "metrics": state.metrics.snapshot(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Telephony WebSocket
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelephonyQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn telephony_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<std::net::SocketAddr>,
    Query(query): Query<TelephonyQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    // The policy itself is external; the ingest only enforces its verdict.
    let bearer_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(query.token);
    let context = AuthContext {
        remote_addr: Some(remote_addr),
        bearer_token,
    };

    if !state.ingest.auth.authorize(&context) {
        log::warn!("[Ingest] Rejected connection from {}", remote_addr);
        return StatusCode::FORBIDDEN.into_response();
    }

    let ingest = state.ingest.clone();
    ws.on_upgrade(move |socket| handle_telephony_socket(socket, ingest))
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Calls API
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestTranscriptBody {
    call_id: String,
    seq: u64,
    #[serde(default)]
    ts: Option<u64>,
    text: String,
    #[serde(default)]
    speaker: Option<Speaker>,
    #[serde(default)]
    tenant_id: Option<String>,
}

/// Direct transcript injection (no bus hop) - used by sidecar tooling and
/// tests of the enrichment chain.
async fn ingest_transcript(
    State(state): State<AppState>,
    Json(body): Json<IngestTranscriptBody>,
) -> AssistResult<Json<serde_json::Value>> {
    if body.text.trim().is_empty() {
        return Err(AssistError::InvalidRequest("text must be non-empty".into()));
    }

    let tenant_id = body.tenant_id.unwrap_or_else(|| "default".to_string());
    let transcript = Transcript {
        interaction_id: body.call_id,
        seq: body.seq,
        ts: body.ts.unwrap_or_else(crate::utils::now_millis),
        text: body.text,
        kind: TranscriptKind::Final,
        speaker: body.speaker.unwrap_or_default(),
        confidence: None,
    };

    state.consumer.ingest_direct(&tenant_id, transcript).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct ActiveQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn active_calls(
    State(state): State<AppState>,
    Query(query): Query<ActiveQuery>,
) -> AssistResult<Json<serde_json::Value>> {
    let calls = state.registry.list_active(query.limit).await?;
    Ok(Json(json!({ "calls": calls })))
}

async fn call_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AssistResult<Json<serde_json::Value>> {
    // Fresh cache first; fall back to the store for older calls.
    if let Some(lines) = state.consumer.cache.read(&id) {
        return Ok(Json(json!({ "callId": id, "lines": lines, "source": "cache" })));
    }

    let rows = state
        .store
        .transcript_for_call(&id)
        .await
        .map_err(|e| AssistError::Store(e.to_string()))?;
    if rows.is_empty() {
        return Err(AssistError::CallNotFound(id));
    }
    Ok(Json(json!({ "callId": id, "lines": rows, "source": "store" })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryBody {
    call_id: String,
    #[serde(default)]
    tenant_id: Option<String>,
}

async fn call_summary(
    State(state): State<AppState>,
    Json(body): Json<SummaryBody>,
) -> AssistResult<Json<serde_json::Value>> {
    let tenant_id = body.tenant_id.unwrap_or_else(|| "default".to_string());
    let summary = state.summary.summarise(&body.call_id, &tenant_id).await?;
    // A fallback summary is surfaced, not hidden - the dashboard decides
    // what to do with it.
    Ok(Json(json!({ "ok": !summary.used_fallback, "summary": summary })))
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispositionBody {
    code: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

async fn save_disposition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DispositionBody>,
) -> AssistResult<Json<serde_json::Value>> {
    if body.code.trim().is_empty() {
        return Err(AssistError::InvalidRequest("code must be non-empty".into()));
    }

    state
        .store
        .save_disposition(DispositionRow {
            call_id: id,
            code: body.code,
            title: body.title,
            agent_id: body.agent_id,
            ts: crate::utils::now_millis(),
        })
        .await
        .map_err(|e| AssistError::Store(e.to_string()))?;

    Ok(Json(json!({ "ok": true })))
}
