use super::*;
use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::Request,
};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use storage::{StoreError, StoreResult};
use tower::ServiceExt;

struct OfflineStore;

#[async_trait]
impl CounterStore for OfflineStore {
    async fn get(&self) -> StoreResult<u64> {
        Err(StoreError::Timeout(Duration::from_millis(10)))
    }

    async fn increment(&self, _delta: u64) -> StoreResult<u64> {
        Err(StoreError::Timeout(Duration::from_millis(10)))
    }

    async fn decrement(&self, _delta: u64) -> StoreResult<u64> {
        Err(StoreError::Timeout(Duration::from_millis(10)))
    }

    async fn reset(&self) -> StoreResult<u64> {
        Err(StoreError::Timeout(Duration::from_millis(10)))
    }
}

/// Applies increments immediately but holds the first caller back before it
/// returns, so a second increment can commit and answer first.
#[derive(Default)]
struct SlowFirstStore {
    inner: MemoryStore,
    delayed: AtomicBool,
}

#[async_trait]
impl CounterStore for SlowFirstStore {
    async fn get(&self) -> StoreResult<u64> {
        self.inner.get().await
    }

    async fn increment(&self, delta: u64) -> StoreResult<u64> {
        let count = self.inner.increment(delta).await?;
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(count)
    }

    async fn decrement(&self, delta: u64) -> StoreResult<u64> {
        self.inner.decrement(delta).await
    }

    async fn reset(&self) -> StoreResult<u64> {
        self.inner.reset().await
    }
}

fn test_app_with(api: ApiContext) -> (Router, broadcast::Sender<ServerEvent>) {
    let (events, _) = broadcast::channel(32);
    let app = build_router(Arc::new(AppState::new(api, events.clone())));
    (app, events)
}

fn test_app() -> (Router, broadcast::Sender<ServerEvent>) {
    test_app_with(ApiContext::new(MemoryStore::new()))
}

async fn post_json(
    app: &Router,
    path: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, Vec<u8>) {
    let body = match body {
        Some(json) => Body::from(json.to_string()),
        None => Body::empty(),
    };
    let request = Request::post(path)
        .header("content-type", "application/json")
        .body(body)
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, bytes.to_vec())
}

async fn count_of(app: &Router) -> u64 {
    let request = Request::get("/api/count")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let dto: CountResponse = serde_json::from_slice(&bytes).expect("json");
    dto.count
}

fn parse_count(bytes: &[u8]) -> u64 {
    serde_json::from_slice::<CountResponse>(bytes)
        .expect("count json")
        .count
}

fn parse_error(bytes: &[u8]) -> ApiError {
    serde_json::from_slice(bytes).expect("error json")
}

#[tokio::test]
async fn healthz_reports_ok_when_store_is_ready() {
    let (app, _events) = test_app();
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn reference_scenario_over_http() {
    let (app, _events) = test_app();
    assert_eq!(count_of(&app).await, 0);

    let (status, body) = post_json(
        &app,
        "/api/count/increment",
        Some(serde_json::json!({ "value": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_count(&body), 5);

    let (_, body) = post_json(
        &app,
        "/api/count/increment",
        Some(serde_json::json!({ "value": 3 })),
    )
    .await;
    assert_eq!(parse_count(&body), 8);

    let (_, body) = post_json(
        &app,
        "/api/count/decrement",
        Some(serde_json::json!({ "value": 10 })),
    )
    .await;
    assert_eq!(parse_count(&body), 0);

    let (status, body) = post_json(&app, "/api/count/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_count(&body), 0);
    assert_eq!(count_of(&app).await, 0);
}

#[tokio::test]
async fn missing_amount_defaults_to_one() {
    let (app, _events) = test_app();
    let (status, body) = post_json(&app, "/api/count/increment", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_count(&body), 1);

    let (_, body) = post_json(&app, "/api/count/increment", Some(serde_json::json!({}))).await;
    assert_eq!(parse_count(&body), 2);

    let (_, body) = post_json(&app, "/api/count/decrement", None).await;
    assert_eq!(parse_count(&body), 1);
}

#[tokio::test]
async fn non_numeric_amount_is_rejected_without_mutation() {
    let (app, _events) = test_app();
    post_json(&app, "/api/count/increment", Some(serde_json::json!({ "value": 4 }))).await;

    let (status, body) = post_json(
        &app,
        "/api/count/increment",
        Some(serde_json::json!({ "value": "lots" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_error(&body).code, ErrorCode::InvalidAmount);

    let (status, _) = post_json(
        &app,
        "/api/count/decrement",
        Some(serde_json::json!({ "value": -2 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(count_of(&app).await, 4);
}

#[tokio::test]
async fn storage_outage_maps_to_service_unavailable() {
    let (app, _events) = test_app_with(ApiContext::new(OfflineStore));

    let request = Request::get("/api/count")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = post_json(&app, "/api/count/reset", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let err = parse_error(&body);
    assert_eq!(err.code, ErrorCode::StorageUnavailable);
    assert!(err.message.contains("reset"));

    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn mutations_are_published_to_subscribers() {
    let (app, events) = test_app();
    let mut rx = events.subscribe();

    post_json(&app, "/api/count/increment", Some(serde_json::json!({ "value": 7 }))).await;
    post_json(&app, "/api/count/decrement", Some(serde_json::json!({ "value": 2 }))).await;
    post_json(&app, "/api/count/reset", None).await;

    let counts: Vec<u64> = vec![
        rx.recv().await.expect("first").count(),
        rx.recv().await.expect("second").count(),
        rx.recv().await.expect("third").count(),
    ];
    assert_eq!(counts, vec![7, 5, 0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_mutations_publish_in_commit_order() {
    let (app, events) = test_app_with(ApiContext::new(SlowFirstStore::default()));
    let mut rx = events.subscribe();

    let first = {
        let app = app.clone();
        tokio::spawn(async move { post_json(&app, "/api/count/increment", None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let app = app.clone();
        tokio::spawn(async move { post_json(&app, "/api/count/increment", None).await })
    };
    first.await.expect("first");
    second.await.expect("second");

    let pushed = vec![
        rx.recv().await.expect("first event").count(),
        rx.recv().await.expect("second event").count(),
    ];
    assert_eq!(pushed, vec![1, 2]);
    assert_eq!(pushed.last().copied(), Some(count_of(&app).await));
}

#[tokio::test]
async fn rejected_mutations_are_not_published() {
    let (app, events) = test_app();
    let mut rx = events.subscribe();

    post_json(&app, "/api/count/increment", Some(serde_json::json!({ "value": 1.5 }))).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_http_increments_are_all_counted() {
    let (app, _events) = test_app();
    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { post_json(&app, "/api/count/increment", None).await })
        })
        .collect();
    for task in tasks {
        let (status, _) = task.await.expect("task");
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(count_of(&app).await, 100);
}

#[tokio::test]
async fn sqlite_backed_router_persists_counts() {
    let api = ApiContext::new(Storage::new("sqlite::memory:").await.expect("db"));
    let (app, _events) = test_app_with(api);

    post_json(&app, "/api/count/increment", Some(serde_json::json!({ "value": 12 }))).await;
    let (_, body) = post_json(
        &app,
        "/api/count/decrement",
        Some(serde_json::json!({ "value": 1000 })),
    )
    .await;
    assert_eq!(parse_count(&body), 0);
}

#[test]
fn error_codes_map_to_statuses() {
    assert_eq!(status_for(ErrorCode::InvalidAmount), StatusCode::BAD_REQUEST);
    assert_eq!(
        status_for(ErrorCode::StorageUnavailable),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        status_for(ErrorCode::Unknown),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
