use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use futures_core::Stream;
use serde_json::json;

use super::{ApiError, AppState, RunRequest, bad_request};

/// `POST /api/run` starts a run of the current config and streams its events.
///
/// Starting a run cancels the one in flight; that run's stream receives a
/// `done` frame carrying the cancellation before it closes.
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ApiError>)> {
    let request: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| bad_request(format!("invalid request body: {e}")))?
    };

    let config = state.config.load_full().as_ref().clone();
    let mut handle = state.supervisor.start(config, request.objective);
    log::info!("streaming run {}", handle.run_id);

    let events = async_stream::stream! {
        while let Some(event) = handle.events.recv().await {
            let is_done = event.is_done();
            match serde_json::to_string(&event) {
                Ok(data) => yield Ok::<_, Infallible>(Event::default().data(data)),
                Err(e) => log::error!("failed to encode run event: {e}"),
            }
            if is_done {
                break;
            }
        }
    };

    Ok(Sse::new(events))
}

/// `DELETE /api/run` cancels the run in flight, if any.
pub async fn cancel_run(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cancelled = state.supervisor.cancel();
    Json(json!({ "cancelled": cancelled }))
}
