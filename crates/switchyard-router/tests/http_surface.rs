use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use switchyard_core::{HttpClientPool, Orchestrator};
use switchyard_oauth::{MemoryStore, OAuthConfig, TokenManager};
use switchyard_pool::{ConfigStore, HealthEngine};
use switchyard_router::router;

const CONFIG: &str = r#"
providers:
  - name: main
    type: anthropic
    base_url: http://main.local
    auth_type: api_key
    auth_value: key
model_routes:
  "claude-*":
    - provider: main
settings:
  auth:
    enabled: true
    api_key: secret-key
    exempt_paths:
      - /health
"#;

fn app() -> Router {
    let store = Arc::new(ConfigStore::from_str(CONFIG).unwrap());
    let health = Arc::new(HealthEngine::new());
    let oauth =
        TokenManager::new(OAuthConfig::default(), Arc::new(MemoryStore::new())).unwrap();
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        health,
        oauth,
        Arc::new(HttpClientPool::new()),
    ));
    router(orchestrator)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_exempt_from_auth() {
    let response = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn missing_key_is_rejected_with_anthropic_error_body() {
    let response = app()
        .oneshot(
            Request::get("/providers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["type"], "error");
    assert_eq!(json["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn x_api_key_and_bearer_are_both_accepted() {
    let response = app()
        .oneshot(
            Request::get("/providers")
                .header("x-api-key", "secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app()
        .oneshot(
            Request::get("/providers")
                .header("authorization", "Bearer secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json[0]["name"], "main");
    assert_eq!(json[0]["healthy"], true);
}

#[tokio::test]
async fn malformed_messages_body_is_a_400() {
    let response = app()
        .oneshot(
            Request::post("/v1/messages")
                .header("x-api-key", "secret-key")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn count_tokens_returns_an_estimate() {
    let body = serde_json::json!({
        "model": "claude-3-5-haiku-20241022",
        "messages": [{"role": "user", "content": "hello world"}],
    });
    let response = app()
        .oneshot(
            Request::post("/v1/messages/count_tokens")
                .header("x-api-key", "secret-key")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["input_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn oauth_status_starts_empty() {
    let response = app()
        .oneshot(
            Request::get("/oauth/status")
                .header("x-api-key", "secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json, serde_json::json!([]));
}
