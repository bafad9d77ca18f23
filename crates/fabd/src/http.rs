//! The coordinator's HTTP surface.
//!
//! `GET /status` reports liveness; `GET /api/status` serves the run's
//! build states; `GET /api/log?buildhash=<hex>` streams a build log as
//! server-sent events (`log` events with JSON payloads, then one
//! `terminate` event whose payload is `"EOF"` or the error text).

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;

use crate::logs::{LogError, LogManager, LogStream};
use crate::status::StatusBoard;

#[derive(Clone)]
pub struct AppState {
    pub logs: Arc<LogManager>,
    pub status: Arc<StatusBoard>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(|| async { "online" }))
        .route("/api/status", get(api_status))
        .route("/api/log", get(api_log))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.snapshot())
}

#[derive(Deserialize)]
struct LogQuery {
    buildhash: String,
}

async fn api_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let raw = hex::decode(&query.buildhash)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("bad buildhash: {e}")))?;
    let digest: [u8; 32] = raw
        .try_into()
        .map_err(|_| (StatusCode::BAD_REQUEST, "buildhash must be 32 bytes".to_string()))?;

    let stream = match state.logs.stream(&digest).await {
        Ok(stream) => stream,
        Err(LogError::NotFound(_)) => {
            return Err((StatusCode::NOT_FOUND, "build not found".to_string()))
        }
        Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    let events = futures::stream::unfold(Some(stream), |state| async move {
        let mut stream: LogStream = state?;
        match stream.next_line().await {
            Some(line) => {
                let payload =
                    serde_json::to_string(&line).expect("log lines always encode");
                Some((
                    Ok::<Event, Infallible>(Event::default().event("log").data(payload)),
                    Some(stream),
                ))
            }
            // end of log: terminate cleanly, then end the stream
            None => Some((
                Ok(Event::default().event("terminate").data("EOF")),
                None,
            )),
        }
    });

    Ok(Sse::new(events))
}
