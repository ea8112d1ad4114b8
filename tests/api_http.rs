// tests/api_http.rs
//
// HTTP-level tests for the status Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /status (phase, last report, seen-set size)
// - GET /subscribers (ok and store closed)
// - GET /metrics

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use deal_notifier::api::{self, AppState};
use deal_notifier::ingest::scheduler::{CyclePhase, SharedStatus};
use deal_notifier::metrics::Metrics;
use deal_notifier::models::{ChatId, SubscriberStatus};
use deal_notifier::store::{MemoryStore, StateStore};

const BODY_LIMIT: usize = 1024 * 1024;

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
    store.upsert_subscriber(ChatId(1), now).await.unwrap();
    store.upsert_subscriber(ChatId(2), now).await.unwrap();
    store
        .set_subscriber_status(ChatId(2), SubscriberStatus::Suspended, now)
        .await
        .unwrap();
    store.reserve_seen("https://mydealz.de/deal/1", now).await.unwrap();
    store
}

fn app(store: Arc<MemoryStore>, status: SharedStatus) -> Router {
    api::router(AppState {
        feeds: vec!["mydealz".into(), "preisjaeger".into()],
        status,
        store,
        metrics: Some(Metrics::detached()),
    })
}

async fn get(app: Router, uri: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, String::from_utf8(bytes).expect("utf8"))
}

#[tokio::test]
async fn health_returns_ok() {
    let (status, body) = get(app(seeded_store().await, SharedStatus::default()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.trim(), "ok");
}

#[tokio::test]
async fn status_reports_phase_and_store_counts() {
    let shared = SharedStatus::default();
    {
        let mut st = shared.write().unwrap();
        st.phase = CyclePhase::Dispatching;
        st.cycles_ok = 4;
    }
    let (status, body) = get(app(seeded_store().await, shared), "/status").await;
    assert_eq!(status, StatusCode::OK);

    let v: Json = serde_json::from_str(&body).expect("json");
    assert_eq!(v["feeds"], serde_json::json!(["mydealz", "preisjaeger"]));
    assert_eq!(v["phase"], "dispatching");
    assert_eq!(v["cycles_ok"], 4);
    assert_eq!(v["seen_ids"], 1);
    assert_eq!(v["active_subscribers"], 1);
    assert!(v["last_report"].is_null());
}

#[tokio::test]
async fn subscribers_lists_status() {
    let (status, body) = get(app(seeded_store().await, SharedStatus::default()), "/subscribers").await;
    assert_eq!(status, StatusCode::OK);

    let v: Json = serde_json::from_str(&body).expect("json");
    let rows = v.as_array().expect("array");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["chat_id"], 1);
    assert_eq!(rows[0]["status"], "active");
    assert_eq!(rows[1]["status"], "suspended");
}

#[tokio::test]
async fn closed_store_degrades_gracefully() {
    let store = seeded_store().await;
    store.close().await.unwrap();

    let (status, _) = get(app(store.clone(), SharedStatus::default()), "/subscribers").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = get(app(store, SharedStatus::default()), "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_str(&body).expect("json");
    assert!(v["seen_ids"].is_null());
}

#[tokio::test]
async fn metrics_endpoint_is_mounted() {
    let (status, _) = get(app(seeded_store().await, SharedStatus::default()), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
}
