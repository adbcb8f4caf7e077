//! Integration tests for the admin API.

use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::InMemoryChannel;
use saga::results_export::DEFAULT_STEP_TIMEOUT;
use saga_store::InMemorySagaStore;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> axum::Router {
    let state = saga_server::create_default_state(
        InMemorySagaStore::new(),
        InMemoryChannel::new(),
        DEFAULT_STEP_TIMEOUT,
    )
    .unwrap();
    saga_server::create_app(state, get_metrics_handle())
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn start_export(app: &axum::Router, session_id: &str) -> (StatusCode, serde_json::Value) {
    send(
        app,
        post_json(
            "/results-exports",
            serde_json::json!({
                "session_id": session_id,
                "assessment_code": "MATH-101",
                "user": "alice"
            }),
        ),
    )
    .await
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["saga"], "RESULTS_EXPORT");
    assert_eq!(json["topic"], "results-export");
}

#[tokio::test]
async fn test_start_export() {
    let app = setup();

    let (status, json) = start_export(&app, "session-1").await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["saga_name"], "RESULTS_EXPORT");
    assert_eq!(json["status"], "IN_PROGRESS");
    assert_eq!(json["create_user"], "alice");
    assert_eq!(json["correlation_ids"]["session_id"], "session-1");
    assert!(json["saga_state"].is_null());
}

#[tokio::test]
async fn test_second_export_for_session_is_conflict() {
    let app = setup();

    let (status, _) = start_export(&app, "session-1").await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json) = start_export(&app, "session-1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().is_some());

    let (status, _) = start_export(&app, "session-2").await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_start_export_requires_fields() {
    let app = setup();

    let (status, _) = send(
        &app,
        post_json(
            "/results-exports",
            serde_json::json!({ "session_id": "  ", "assessment_code": "MATH-101" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_saga() {
    let app = setup();
    let (_, created) = start_export(&app, "session-1").await;
    let saga_id = created["saga_id"].as_str().unwrap();

    let (status, json) = send(&app, get(&format!("/sagas/{saga_id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["saga_id"], saga_id);
    assert_eq!(json["status"], "IN_PROGRESS");
    assert_eq!(json["retry_count"], 0);
}

#[tokio::test]
async fn test_get_unknown_saga_is_not_found() {
    let app = setup();

    let (status, _) = send(
        &app,
        get("/sagas/00000000-0000-0000-0000-000000000000"),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_saga_id_is_bad_request() {
    let app = setup();

    let (status, _) = send(&app, get("/sagas/not-a-uuid")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_events_of_unstarted_saga_are_empty() {
    // No worker runs in these tests, so nothing is recorded yet.
    let app = setup();
    let (_, created) = start_export(&app, "session-1").await;
    let saga_id = created["saga_id"].as_str().unwrap();

    let (status, json) = send(&app, get(&format!("/sagas/{saga_id}/events"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().map(Vec::len), Some(0));

    let (status, _) = send(
        &app,
        get("/sagas/00000000-0000-0000-0000-000000000000/events"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fail_saga() {
    let app = setup();
    let (_, created) = start_export(&app, "session-1").await;
    let saga_id = created["saga_id"].as_str().unwrap();

    let (status, json) = send(
        &app,
        post_json(
            &format!("/sagas/{saga_id}/fail"),
            serde_json::json!({ "user": "operator" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "FAILED");
    assert_eq!(json["update_user"], "operator");

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/sagas/{saga_id}/fail"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_failed_saga_frees_the_session() {
    let app = setup();
    let (_, created) = start_export(&app, "session-1").await;
    let saga_id = created["saga_id"].as_str().unwrap();

    send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/sagas/{saga_id}/fail"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    let (status, _) = start_export(&app, "session-1").await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
