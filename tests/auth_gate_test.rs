//! Integration tests for the local API and its auth gate.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use tower::ServiceExt;

use tether::config::{Config, ConfigStore};
use tether::context::AppContext;
use tether::keyring::MemoryStore;
use tether::server;
use tether::webhooks::WebhookStore;

fn setup(config: Config) -> (AppContext, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let (ctx, _rx) = AppContext::new(
        store.clone(),
        ConfigStore::in_memory(config),
        WebhookStore::in_memory(),
    )
    .unwrap();
    (ctx, store)
}

fn provisioned() -> (AppContext, Arc<MemoryStore>) {
    let (ctx, store) = setup(Config::default());
    ctx.vault.store_server_password("hunter2").unwrap();
    (ctx, store)
}

async fn get(ctx: &AppContext, uri: &str, auth: Option<&str>) -> Response {
    let mut builder = Request::builder().uri(uri);
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    server::router(ctx.clone())
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_needs_no_credential() {
    let (ctx, _) = setup(Config::default());
    let response = get(&ctx, "/api/v1/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_credential_is_401() {
    let (ctx, _) = provisioned();
    let response = get(&ctx, "/api/v1/ping", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "Unauthorized");
    assert_eq!(body["error"]["message"], "missing credential");
}

#[tokio::test]
async fn test_wrong_credential_is_401() {
    let (ctx, _) = provisioned();
    let response = get(&ctx, "/api/v1/ping", Some("Bearer hunter3")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["message"], "invalid credential");
}

#[tokio::test]
async fn test_bearer_credential_passes() {
    let (ctx, _) = provisioned();
    let response = get(&ctx, "/api/v1/ping", Some("Bearer hunter2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!({"message": "pong"}));
}

#[tokio::test]
async fn test_legacy_query_credentials_pass() {
    let (ctx, _) = provisioned();
    for uri in [
        "/api/v1/ping?guid=hunter2",
        "/api/v1/ping?password=hunter2",
        "/api/v1/ping?token=hunter2",
        "/api/v1/ping?password=%20hunter2%20",
    ] {
        let response = get(&ctx, uri, None).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn test_bearer_header_takes_precedence_over_query() {
    let (ctx, _) = provisioned();
    let response = get(&ctx, "/api/v1/ping?guid=hunter2", Some("Bearer wrong")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_present_header_disables_query_fallback() {
    let (ctx, _) = provisioned();
    for auth in ["Basic Zm9vOmJhcg==", "Bearer ", "Token hunter3"] {
        let response = get(&ctx, "/api/v1/ping?password=hunter2", Some(auth)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{auth}");
    }
}

#[tokio::test]
async fn test_unprovisioned_server_is_500_not_401() {
    let (ctx, _) = setup(Config::default());
    let response = get(&ctx, "/api/v1/ping", Some("Bearer anything")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "ServerError");
}

#[tokio::test]
async fn test_legacy_config_password_is_fallback() {
    let config = Config {
        password: Some("from-config".into()),
        ..Default::default()
    };
    let (ctx, _) = setup(config);
    let response = get(&ctx, "/api/v1/ping", Some("Bearer from-config")).await;
    assert_eq!(response.status(), StatusCode::OK);

    // The vault wins once provisioned.
    ctx.vault.store_server_password("hunter2").unwrap();
    let response = get(&ctx, "/api/v1/ping", Some("Bearer from-config")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unavailable_store_is_503() {
    let (ctx, store) = provisioned();
    store.set_unavailable(true);
    let response = get(&ctx, "/api/v1/ping", Some("Bearer hunter2")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_server_info_reports_identity() {
    let (ctx, _) = provisioned();
    let (identity, _) = ctx.vault.ensure_identity().unwrap();

    let response = get(&ctx, "/api/v1/server/info", Some("Bearer hunter2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["device_id"], identity.device_id());
    assert_eq!(body["fingerprint"], identity.fingerprint());
    assert_eq!(body["onboarding_complete"], false);
}

#[tokio::test]
async fn test_webhook_crud() {
    let (ctx, _) = provisioned();
    let app = server::router(ctx.clone());

    let create = Request::builder()
        .method("POST")
        .uri("/api/v1/webhook")
        .header("authorization", "Bearer hunter2")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"url":"https://hooks.example/in","events":["message.sent"]}"#,
        ))
        .unwrap();
    let response = app.clone().oneshot(create).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["url"], "https://hooks.example/in");
    let id = created["id"].as_i64().unwrap();

    let response = get(&ctx, "/api/v1/webhook", Some("Bearer hunter2")).await;
    let listed = json_body(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let remove = |id: i64| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/webhook/{id}"))
            .header("authorization", "Bearer hunter2")
            .body(Body::empty())
            .unwrap()
    };
    let response = app.clone().oneshot(remove(id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app.clone().oneshot(remove(id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_create_validates() {
    let (ctx, _) = provisioned();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/webhook")
        .header("authorization", "Bearer hunter2")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"url":"ftp://nope","events":["*"]}"#))
        .unwrap();
    let response = server::router(ctx.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(ctx.webhooks.list().is_empty());
}

#[tokio::test]
async fn test_webhook_routes_are_gated() {
    let (ctx, _) = provisioned();
    let response = get(&ctx, "/api/v1/webhook", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
