use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::ingest::scheduler::{CyclePhase, CycleReport, LastError, SharedStatus};
use crate::metrics::Metrics;
use crate::models::Subscriber;
use crate::store::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub feeds: Vec<String>,
    pub status: SharedStatus,
    pub store: Arc<dyn StateStore>,
    pub metrics: Option<Metrics>,
}

pub fn router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .route("/subscribers", get(subscribers))
        .with_state(state);
    match metrics {
        Some(m) => app.merge(m.router()),
        None => app,
    }
}

#[derive(Serialize)]
struct StatusOut {
    feeds: Vec<String>,
    phase: CyclePhase,
    cycles_ok: u64,
    cycles_failed: u64,
    consecutive_failures: u32,
    last_report: Option<CycleReport>,
    last_error: Option<LastError>,
    seen_ids: Option<u64>,
    active_subscribers: Option<usize>,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    let snapshot = state
        .status
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    // A closed or failing store only blanks these fields.
    let seen_ids = state.store.seen_count().await.ok();
    let active_subscribers = state.store.active_subscribers().await.ok().map(|s| s.len());

    Json(StatusOut {
        feeds: state.feeds.clone(),
        phase: snapshot.phase,
        cycles_ok: snapshot.cycles_ok,
        cycles_failed: snapshot.cycles_failed,
        consecutive_failures: snapshot.consecutive_failures,
        last_report: snapshot.last_report,
        last_error: snapshot.last_error,
        seen_ids,
        active_subscribers,
    })
}

async fn subscribers(State(state): State<AppState>) -> Response {
    match state.store.subscribers().await {
        Ok(subs) => Json::<Vec<Subscriber>>(subs).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
