use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use marshal_core::{EngineConfig, EngineContext, HeuristicPlanner, TaskRegistry};
use marshal_server::{router, AppState};
use marshal_tools::ToolRegistry;

fn app(workspace: &std::path::Path) -> Router {
    let registry = TaskRegistry::new(EngineContext::new(
        Arc::new(HeuristicPlanner),
        ToolRegistry::new(),
        workspace.to_path_buf(),
        EngineConfig::default(),
    ));
    router(AppState::new(Arc::new(registry)))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(value) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .expect("request"),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    };
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn submit(app: &Router, body: Value) -> String {
    let (status, value) = send(app, Method::POST, "/task", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    value["taskID"].as_str().expect("taskID").to_string()
}

async fn wait_for_status(app: &Router, task_id: &str, wanted: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, task) = send(app, Method::GET, &format!("/task/{task_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if task["status"] == wanted {
            return task;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("task never reached `{wanted}`, last: {}", task["status"]);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let ws = tempfile::tempdir().unwrap();
    let app = app(ws.path());
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn submit_rejects_an_empty_instruction() {
    let ws = tempfile::tempdir().unwrap();
    let app = app(ws.path());
    let (status, body) = send(
        &app,
        Method::POST,
        "/task",
        Some(json!({"instruction": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("instruction"));
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let ws = tempfile::tempdir().unwrap();
    let app = app(ws.path());
    let (status, _) = send(&app, Method::GET, "/task/task_nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dry_run_task_completes_without_touching_the_workspace() {
    let ws = tempfile::tempdir().unwrap();
    let app = app(ws.path());

    let task_id = submit(
        &app,
        json!({"instruction": "create hello.py", "dryRun": true, "generatePreview": true}),
    )
    .await;

    let task = wait_for_status(&app, &task_id, "completed").await;
    assert_eq!(task["result"]["dry_run"], true);
    assert!(task["preview"]["title"].as_str().is_some());
    assert!(!ws.path().join("hello.py").exists());

    let (status, list) = send(&app, Method::GET, "/task", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["tasks"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn critical_task_parks_then_reject_fails_it() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::create_dir(ws.path().join("build")).unwrap();
    let app = app(ws.path());

    let task_id = submit(
        &app,
        json!({"instruction": "delete the build directory", "autoApprove": true}),
    )
    .await;

    wait_for_status(&app, &task_id, "awaiting_approval").await;

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/task/{task_id}/approval"),
        Some(json!({"decision": "reject"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let task = wait_for_status(&app, &task_id, "failed").await;
    assert_eq!(task["error"]["kind"], "rejected");
    assert!(ws.path().join("build").exists());

    let (second, body) = send(
        &app,
        Method::POST,
        &format!("/task/{task_id}/approval"),
        Some(json!({"decision": "approve"})),
    )
    .await;
    assert_eq!(second, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("invalid transition"));
}

#[tokio::test]
async fn unknown_decision_is_a_bad_request() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::create_dir(ws.path().join("build")).unwrap();
    let app = app(ws.path());

    let task_id = submit(&app, json!({"instruction": "delete the build directory"})).await;
    wait_for_status(&app, &task_id, "awaiting_approval").await;

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/task/{task_id}/approval"),
        Some(json!({"decision": "maybe"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // leave no parked task behind
    let (cancelled, _) = send(
        &app,
        Method::POST,
        &format!("/task/{task_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(cancelled, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn cancel_then_delete_evicts_the_task() {
    let ws = tempfile::tempdir().unwrap();
    std::fs::create_dir(ws.path().join("build")).unwrap();
    let app = app(ws.path());

    let task_id = submit(&app, json!({"instruction": "delete the build directory"})).await;
    wait_for_status(&app, &task_id, "awaiting_approval").await;

    // deleting a non-terminal task is refused
    let (premature, _) = send(&app, Method::DELETE, &format!("/task/{task_id}"), None).await;
    assert_eq!(premature, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/task/{task_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_status(&app, &task_id, "cancelled").await;

    let (deleted, task) = send(&app, Method::DELETE, &format!("/task/{task_id}"), None).await;
    assert_eq!(deleted, StatusCode::OK);
    assert_eq!(task["status"], "cancelled");

    let (gone, _) = send(&app, Method::GET, &format!("/task/{task_id}"), None).await;
    assert_eq!(gone, StatusCode::NOT_FOUND);

    // a second cancel on the evicted task is not found either
    let (missing, _) = send(
        &app,
        Method::POST,
        &format!("/task/{task_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(missing, StatusCode::NOT_FOUND);
}
