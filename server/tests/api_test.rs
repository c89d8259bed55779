//! HTTP surface tests, driven through the router without a socket.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{catalog, memory, settings};
use converge_server::adapters::{MemoryAdapter, Origins};
use converge_server::config::Config;
use converge_server::runner::{RunSettings, Runner};
use converge_server::AppState;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

// =============================================================================
// Test Helpers
// =============================================================================

fn config(auth_secret: Option<&str>, run: RunSettings) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        catalog_path: PathBuf::from("catalog.json"),
        auth_secret: auth_secret.map(str::to_string),
        journal_dir: None,
        retained_runs: 100,
        run,
    }
}

fn app_with(
    desired: MemoryAdapter,
    actual: Arc<MemoryAdapter>,
    auth_secret: Option<&str>,
    run: RunSettings,
) -> Router {
    let origins = Origins::new().with(Arc::new(desired)).with(actual);
    let runner = Runner::new(Arc::new(catalog()), Arc::new(origins), run);
    converge_server::app(AppState::new(config(auth_secret, run), runner))
}

fn users_app(actual: Arc<MemoryAdapter>) -> Router {
    let desired = memory(
        "desired",
        "user",
        vec![
            json!({"id": "1", "name": "Ada"}),
            json!({"id": "2", "name": "Grace"}),
        ],
    );
    app_with(desired, actual, None, settings())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn users_request() -> Value {
    json!({
        "entityKinds": ["user"],
        "desiredOrigin": "desired",
        "actualOrigin": "actual"
    })
}

async fn wait_for_state(app: &Router, run_id: &str, state: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, get(&format!("/runs/{run_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        if body["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached {state}");
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn health_reports_ok() {
    let app = users_app(Arc::new(MemoryAdapter::new("actual", catalog())));

    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeRuns"], 0);
}

// =============================================================================
// Runs
// =============================================================================

#[tokio::test]
async fn sync_run_returns_report() {
    let actual = Arc::new(MemoryAdapter::new("actual", catalog()));
    let app = users_app(actual.clone());

    let (status, body) = send(&app, post("/runs/sync", users_request())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "done");
    assert_eq!(body["planned"]["creates"], 2);
    assert_eq!(body["entries"].as_array().unwrap().len(), 2);
    assert_eq!(actual.records("user").len(), 2);

    let run_id = body["runId"].as_str().unwrap();
    let (status, body) = send(&app, get(&format!("/runs/{run_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "done");
    assert_eq!(body["report"]["runId"], run_id);
}

#[tokio::test]
async fn report_is_served_as_json_lines() {
    let app = users_app(Arc::new(MemoryAdapter::new("actual", catalog())));
    let (_, body) = send(&app, post("/runs/sync", users_request())).await;
    let run_id = body["runId"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(get(&format!("/runs/{run_id}/report")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["line"], "run");
    assert!(lines[1..].iter().all(|line| line["line"] == "entry"));
}

#[tokio::test]
async fn unknown_origin_is_bad_request() {
    let app = users_app(Arc::new(MemoryAdapter::new("actual", catalog())));

    let (status, body) = send(
        &app,
        post(
            "/runs/sync",
            json!({
                "entityKinds": ["user"],
                "desiredOrigin": "desired",
                "actualOrigin": "nowhere"
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("nowhere"));
}

#[tokio::test]
async fn invalid_threshold_is_bad_request() {
    let app = users_app(Arc::new(MemoryAdapter::new("actual", catalog())));
    let mut request = users_request();
    request["blastRadiusThreshold"] = json!(1.5);

    let (status, _) = send(&app, post("/runs", request)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let app = users_app(Arc::new(MemoryAdapter::new("actual", catalog())));

    let (status, _) = send(
        &app,
        get("/runs/00000000-0000-4000-8000-000000000000"),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn background_run_waits_for_confirmation() {
    let actual = Arc::new(MemoryAdapter::new("actual", catalog()));
    actual
        .seed(
            "user",
            vec![
                json!({"id": "1", "name": "Ada"}),
                json!({"id": "8", "name": "Old"}),
                json!({"id": "9", "name": "Older"}),
            ],
        )
        .unwrap();
    let desired = memory("desired", "user", vec![json!({"id": "1", "name": "Ada"})]);
    let run = RunSettings {
        confirmation_timeout: Duration::from_secs(10),
        ..settings()
    };
    let app = app_with(desired, actual.clone(), None, run);

    let mut request = users_request();
    request["destructive"] = json!(true);
    let (status, body) = send(&app, post("/runs", request)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["runId"].as_str().unwrap().to_string();

    let waiting = wait_for_state(&app, &run_id, "awaitingConfirmation").await;
    let fingerprint = waiting["report"]["fingerprint"].as_str().unwrap().to_string();
    assert_eq!(actual.records("user").len(), 3);

    let (status, _) = send(
        &app,
        post(
            &format!("/runs/{run_id}/confirm"),
            json!({"token": fingerprint}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    wait_for_state(&app, &run_id, "done").await;
    assert_eq!(actual.records("user").len(), 1);
}

#[tokio::test]
async fn cancelling_a_waiting_run_fails_it() {
    let actual = Arc::new(MemoryAdapter::new("actual", catalog()));
    actual
        .seed("user", vec![json!({"id": "9", "name": "Old"})])
        .unwrap();
    let desired = MemoryAdapter::new("desired", catalog());
    let run = RunSettings {
        confirmation_timeout: Duration::from_secs(10),
        ..settings()
    };
    let app = app_with(desired, actual.clone(), None, run);

    let mut request = users_request();
    request["destructive"] = json!(true);
    let (_, body) = send(&app, post("/runs", request)).await;
    let run_id = body["runId"].as_str().unwrap().to_string();
    wait_for_state(&app, &run_id, "awaitingConfirmation").await;

    let (status, _) = send(&app, post(&format!("/runs/{run_id}/cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let failed = wait_for_state(&app, &run_id, "failed").await;
    assert_eq!(failed["report"]["failure"]["kind"], "cancelled");
    assert_eq!(actual.records("user").len(), 1);

    let (status, _) = send(&app, post(&format!("/runs/{run_id}/cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn runs_require_bearer_token_when_secret_set() {
    let desired = memory("desired", "user", vec![json!({"id": "1"})]);
    let actual = Arc::new(MemoryAdapter::new("actual", catalog()));
    let app = app_with(desired, actual, Some("s3cret"), settings());

    let (status, _) = send(&app, post("/runs/sync", users_request())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut wrong = post("/runs/sync", users_request());
    wrong
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut right = post("/runs/sync", users_request());
    right
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
    let (status, body) = send(&app, right).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "done");

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}
