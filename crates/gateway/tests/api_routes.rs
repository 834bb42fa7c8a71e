//! HTTP surface driven through the router without binding a socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use tg_domain::config::Config;
use tg_gateway::api;
use tg_gateway::runtime::{EngineSettings, TurnEngine};
use tg_gateway::state::AppState;
use tg_providers::EchoBackend;
use tg_sessions::MemoryStorage;

fn app() -> (Router, Arc<TurnEngine>) {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert_session("s1");
    let engine = TurnEngine::start(
        EngineSettings {
            queue_poll_timeout: std::time::Duration::from_millis(10),
            relay_poll_timeout: std::time::Duration::from_millis(10),
            shutdown_grace: std::time::Duration::from_secs(1),
            ..EngineSettings::default()
        },
        Arc::new(EchoBackend::default()),
        storage,
    );
    let state = AppState {
        config: Arc::new(Config::default()),
        engine: engine.clone(),
    };
    (api::app(state), engine)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(b) => {
            req = req.header("content-type", "application/json");
            Body::from(b.to_owned())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn health_reports_engine_state() {
    let (app, engine) = app();
    let (status, body) = send(&app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue_depth"], 0);
    engine.shutdown().await;

    let (_, body) = send(&app, Method::GET, "/v1/health", None).await;
    assert_eq!(json(&body)["status"], "draining");
}

#[tokio::test]
async fn submit_then_stream_to_completion() {
    let (app, engine) = app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/chat",
        Some(r#"{"session_id":"s1","user_query":"ping"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let receipt = json(&body);
    assert_eq!(receipt["session_id"], "s1");
    assert_eq!(receipt["status"], "QUEUED");
    let rid = receipt["request_id"].as_str().unwrap().to_owned();

    let (status, body) = send(&app, Method::GET, &format!("/v1/chat/s1/{rid}/stream"), None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    let frames: Vec<Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert!(text.contains("event: message"));
    assert_eq!(frames.first().unwrap()["type"], "start");
    let last = frames.last().unwrap();
    assert_eq!(last["type"], "done");
    assert_eq!(last["status"], "COMPLETED");

    let mut result = Value::Null;
    for _ in 0..100 {
        let (status, body) =
            send(&app, Method::GET, &format!("/v1/chat/s1/{rid}/result"), None).await;
        assert_eq!(status, StatusCode::OK);
        result = json(&body);
        if result["status"] == "COMPLETED" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(result["status"], "COMPLETED");
    assert_eq!(result["content"], last["content"]);

    let (_, body) = send(&app, Method::GET, "/v1/sessions/s1/tasks", None).await;
    assert_eq!(json(&body)["tasks"].as_array().unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn submit_errors_use_the_error_envelope() {
    let (app, engine) = app();

    let (status, body) = send(&app, Method::POST, "/v1/chat", Some("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"]["code"], "CHAT_BAD_REQUEST");

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/chat",
        Some(r#"{"session_id":"s1","user_query":"  "}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["error"]["code"], "CHAT_MESSAGE_EMPTY");

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/chat",
        Some(r#"{"session_id":"nope","user_query":"hi"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&body)["error"]["code"], "CHAT_SESSION_NOT_FOUND");

    for route in ["status", "result", "stream"] {
        let (status, body) =
            send(&app, Method::GET, &format!("/v1/chat/s1/missing/{route}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{route}");
        assert_eq!(json(&body)["error"]["code"], "CHAT_TASK_NOT_FOUND");
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn session_lifecycle() {
    let (app, engine) = app();

    let (status, body) = send(&app, Method::POST, "/v1/sessions", Some(r#"{"title":"notes"}"#)).await;
    assert_eq!(status, StatusCode::CREATED);
    let created = json(&body);
    let sid = created["session_id"].as_str().unwrap().to_owned();

    let (_, body) = send(&app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(json(&body)["count"], 2);

    let (status, body) = send(&app, Method::GET, &format!("/v1/sessions/{sid}/messages"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json(&body)["messages"].as_array().unwrap().is_empty());

    let (status, _) = send(&app, Method::DELETE, &format!("/v1/sessions/{sid}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &format!("/v1/sessions/{sid}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, Method::GET, &format!("/v1/sessions/{sid}/messages"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    engine.shutdown().await;
}
