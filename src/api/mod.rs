//! Minimal demo HTTP/SSE transport (SPEC_FULL.md §12).
//!
//! Not the product's real dashboard API — a grounding harness exercising the
//! `StreamEvent` taxonomy end-to-end, alongside one status JSON endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::PatrolEngine;
use crate::findings::FindingsStore;
use crate::stream::StreamBus;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<PatrolEngine>,
    pub findings: Arc<FindingsStore>,
    pub stream: Arc<StreamBus>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/patrol/status", get(get_status))
        .route("/patrol/stream", get(get_stream))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
    next_scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    active_findings: u32,
    active_by_severity: std::collections::HashMap<String, u32>,
}

async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.engine.get_status();
    let summary = state.findings.get_summary();
    Json(StatusResponse {
        running: status.running,
        next_scheduled_at: status.next_scheduled_at,
        last_run_at: status.last_run_at,
        active_findings: summary.total_active,
        active_by_severity: summary.by_severity.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    })
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    last_seq: Option<u64>,
}

async fn get_stream(
    State(state): State<ApiState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.stream.subscribe(query.last_seq);
    let stream = ReceiverStream::new(subscription.rx).filter_map(|event| async move {
        match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(e) => {
                tracing::warn!(error = %e, "[api] failed to serialize stream event");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
