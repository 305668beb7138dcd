//! Integration tests for the HTTP surface
//!
//! Requests are driven through the router with `tower::ServiceExt::oneshot`.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use scopekeeper::config::Config;
use scopekeeper::scope::ServiceCollection;
use scopekeeper::server::build_app;
use scopekeeper::session::SessionId;
use serde_json::{json, Value};
use tower::ServiceExt;

const HEADER: &str = "x-session-id";

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(session) = session {
        builder = builder.header(HEADER, session);
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(uri: &str, session: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(session) = session {
        builder = builder.header(HEADER, session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn session_header(response: &Response) -> String {
    response
        .headers()
        .get(HEADER)
        .expect("session header missing")
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_health_is_bypassed() {
    let app = common::test_app(&Config::default());

    let response = send(&app.router, get("/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(HEADER).is_none());
    assert!(app.state.registry.is_empty());

    let response = send(&app.router, get("/HEALTH", None)).await;
    assert!(response.headers().get(HEADER).is_none());
}

#[tokio::test]
async fn test_request_creates_and_reuses_session() {
    let app = common::test_app(&Config::default());

    let first = send(&app.router, get("/api/session", None)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let session_id = session_header(&first);
    let snapshot = body_json(first).await;
    assert_eq!(snapshot["id"], session_id);
    assert_eq!(snapshot["scope_count"], 1);

    let id: SessionId = session_id.parse().unwrap();
    let session = app.state.registry.get_session(&id).unwrap();
    assert_eq!(session.scope_count(), 0);

    let second = send(&app.router, get("/api/session", Some(&session_id))).await;
    assert_eq!(session_header(&second), session_id);
    assert_eq!(app.state.registry.len(), 1);
}

#[tokio::test]
async fn test_unknown_or_malformed_session_gets_a_new_one() {
    let app = common::test_app(&Config::default());
    let stale = SessionId::new().to_string();

    let response = send(&app.router, get("/api/session", Some(&stale))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_ne!(session_header(&response), stale);

    let response = send(&app.router, get("/api/session", Some("garbage"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.state.registry.len(), 2);
}

#[tokio::test]
async fn test_immediate_sessions_end_before_response() {
    let mut config = Config::default();
    config.session.expire_new_sessions_immediately = true;
    let app = common::test_app(&config);

    let response = send(&app.router, get("/api/session", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.state.registry.is_empty());
}

#[tokio::test]
async fn test_conversation_messages_accumulate_in_session() {
    let app = common::test_app(&Config::default());

    let first = send(
        &app.router,
        post_json(
            "/api/conversations/kitchen/messages",
            None,
            json!({"role": "user", "content": "hello"}),
        ),
    )
    .await;
    let session_id = session_header(&first);
    assert_eq!(body_json(first).await["length"], 1);

    let second = send(
        &app.router,
        post_json(
            "/api/conversations/kitchen/messages",
            Some(&session_id),
            json!({"role": "assistant", "content": "hi"}),
        ),
    )
    .await;
    assert_eq!(body_json(second).await["length"], 2);

    let id: SessionId = session_id.parse().unwrap();
    let session = app.state.registry.get_session(&id).unwrap();
    assert_eq!(session.conversation("kitchen").unwrap().len(), 2);
}

#[tokio::test]
async fn test_order_is_processed_and_found_by_job_id() {
    let app = common::test_app(&Config::default());

    let response = send(
        &app.router,
        post_json(
            "/api/orders",
            None,
            json!({"job_id": "order-42", "items": ["soup", "  ", "bread"]}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let session_id = session_header(&response);
    assert_eq!(body_json(response).await["items"], 3);

    app.state.tasks.close();
    app.state.tasks.wait().await;

    let response = send(&app.router, get("/api/orders/order-42", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["session_id"], session_id);
    assert_eq!(status["complete"], true);
    assert_eq!(status["order"]["results"]["0"]["detail"], "draft: soup");
    assert_eq!(status["order"]["results"]["1"]["succeeded"], false);

    let id: SessionId = session_id.parse().unwrap();
    assert_eq!(app.state.registry.get_session(&id).unwrap().scope_count(), 0);
}

#[tokio::test]
async fn test_duplicate_order_conflicts() {
    let app = common::test_app(&Config::default());
    let body = json!({"job_id": "dup", "items": []});

    let first = send(&app.router, post_json("/api/orders", None, body.clone())).await;
    let session_id = session_header(&first);

    let second = send(&app.router, post_json("/api/orders", Some(&session_id), body)).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_order_is_not_found() {
    let app = common::test_app(&Config::default());
    let response = send(&app.router, get("/api/orders/nope", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("nope"));
}

#[tokio::test]
async fn test_order_without_registered_drafter_is_rejected_up_front() {
    let app = build_app(&Config::default(), ServiceCollection::new()).unwrap();

    let response = send(
        &app.router,
        post_json("/api/orders", None, json!({"job_id": "bare", "items": ["soup"]})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let session_id = session_header(&response);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("ItemDrafter"));

    let id: SessionId = session_id.parse().unwrap();
    assert!(app.state.registry.get_session(&id).unwrap().order().is_none());

    let response = send(&app.router, get("/api/orders/bare", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
