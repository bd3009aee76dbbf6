//! SSE event stream route.
//!
//! `GET /events/stream?callId=X` opens a long-lived `text/event-stream`
//! response fed from the fan-out hub. Each client gets its own channel (one
//! writer per client); registration is dropped with the stream, which is
//! how transport close propagates back to the hub.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use serde::Deserialize;

use super::AppState;
use crate::fanout::SseFrame;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    /// Call to watch; absent means the global bucket (all calls).
    #[serde(default)]
    call_id: Option<String>,
}

/// Converts one hub frame into an axum SSE event.
fn to_event(frame: SseFrame) -> Event {
    match frame {
        SseFrame::Event { name, data } => Event::default().event(name).data(data.to_string()),
        SseFrame::Comment(text) => Event::default().comment(text),
    }
}

/// The SSE endpoint handler.
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let (guard, mut rx) = state.hub.register(query.call_id);

    let stream = async_stream::stream! {
        // The guard lives inside the stream: dropping the response
        // unregisters the client.
        let _guard = guard;
        while let Some(frame) = rx.recv().await {
            yield Ok::<Event, Infallible>(to_event(frame));
        }
    };

    (
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
}
