//! Integration tests for webhook fan-out, signing and heartbeat interpretation.

use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use tether::config::{Config, ConfigStore};
use tether::context::AppContext;
use tether::keyring::MemoryStore;
use tether::signals::{SignalReceiver, UiSignal};
use tether::webhooks::{WebhookEvent, WebhookStore};

fn setup(config: Config) -> (AppContext, SignalReceiver) {
    AppContext::new(
        Arc::new(MemoryStore::new()),
        ConfigStore::in_memory(config),
        WebhookStore::in_memory(),
    )
    .unwrap()
}

fn events(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// Wait until the mock server has seen `count` requests.
async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<Request> {
    for _ in 0..100 {
        let requests = server.received_requests().await.unwrap();
        if requests.len() >= count {
            return requests;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {count} request(s)");
}

async fn next_signal(rx: &mut SignalReceiver) -> UiSignal {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no signal within 5s")
        .expect("signal channel closed")
}

async fn respond_all(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("POST"))
        .respond_with(template)
        .mount(server)
        .await;
}

fn secret_header(request: &Request) -> Option<String> {
    request
        .headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[tokio::test]
async fn test_dispatch_filters_by_event_type() {
    let server = MockServer::start().await;
    respond_all(&server, ResponseTemplate::new(200)).await;
    let (ctx, _rx) = setup(Config::default());

    let base = server.uri();
    ctx.webhooks.create(&format!("{base}/all"), &events(&["*"])).unwrap();
    ctx.webhooks
        .create(&format!("{base}/sent"), &events(&["message.sent"]))
        .unwrap();
    ctx.webhooks
        .create(&format!("{base}/received"), &events(&["message.received"]))
        .unwrap();

    let started = ctx.dispatcher.dispatch(WebhookEvent::new(
        "message.sent",
        serde_json::json!({"guid": "m-1"}),
    ));
    assert_eq!(started, 2);

    let requests = wait_for_requests(&server, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let requests_after = server.received_requests().await.unwrap();
    assert_eq!(requests_after.len(), 2);

    let mut paths: Vec<&str> = requests.iter().map(|r| r.url.path()).collect();
    paths.sort_unstable();
    assert_eq!(paths, vec!["/all", "/sent"]);

    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["type"], "message.sent");
    assert_eq!(body["data"]["guid"], "m-1");
}

#[tokio::test]
async fn test_failing_endpoints_do_not_hold_up_healthy_one() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let (ctx, _rx) = setup(Config::default());

    let base = server.uri();
    ctx.webhooks
        .create("http://127.0.0.1:9/hook", &events(&["*"]))
        .unwrap();
    ctx.webhooks.create(&format!("{base}/slow"), &events(&["*"])).unwrap();
    ctx.webhooks.create(&format!("{base}/ok"), &events(&["*"])).unwrap();

    let started_at = std::time::Instant::now();
    let started = ctx.dispatcher.dispatch(WebhookEvent::new(
        "message.sent",
        serde_json::json!({"guid": "m-2"}),
    ));
    assert_eq!(started, 3);
    assert!(started_at.elapsed() < Duration::from_secs(1));

    let healthy = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let requests = server.received_requests().await.unwrap();
            if let Some(request) = requests.into_iter().find(|r| r.url.path() == "/ok") {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("healthy endpoint not reached while others were failing");

    let body: serde_json::Value = serde_json::from_slice(&healthy.body).unwrap();
    assert_eq!(body["data"]["guid"], "m-2");
}

#[tokio::test]
async fn test_dispatch_without_subscribers_starts_nothing() {
    let (ctx, _rx) = setup(Config::default());
    assert_eq!(
        ctx.dispatcher
            .dispatch(WebhookEvent::new("message.sent", serde_json::Value::Null)),
        0
    );
}

#[tokio::test]
async fn test_delivery_signed_with_vault_secret() {
    let server = MockServer::start().await;
    respond_all(&server, ResponseTemplate::new(200)).await;
    let config = Config {
        webhook_secret: Some("legacy".into()),
        ..Default::default()
    };
    let (ctx, _rx) = setup(config);
    ctx.vault.store_webhook_secret("whsec").unwrap();

    let event = WebhookEvent::new("message.sent", serde_json::Value::Null);
    ctx.dispatcher
        .send_post(&format!("{}/hook", server.uri()), &event)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(secret_header(&requests[0]).as_deref(), Some("Bearer whsec"));
}

#[tokio::test]
async fn test_delivery_falls_back_to_legacy_secret() {
    let server = MockServer::start().await;
    respond_all(&server, ResponseTemplate::new(200)).await;
    let config = Config {
        webhook_secret: Some("legacy".into()),
        ..Default::default()
    };
    let (ctx, _rx) = setup(config);

    let event = WebhookEvent::new("message.sent", serde_json::Value::Null);
    ctx.dispatcher
        .send_post(&format!("{}/hook", server.uri()), &event)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(secret_header(&requests[0]).as_deref(), Some("Bearer legacy"));
}

#[tokio::test]
async fn test_delivery_unsigned_without_secret() {
    let server = MockServer::start().await;
    respond_all(&server, ResponseTemplate::new(200)).await;
    let (ctx, _rx) = setup(Config::default());

    let event = WebhookEvent::new("message.sent", serde_json::Value::Null);
    ctx.dispatcher
        .send_post(&format!("{}/hook", server.uri()), &event)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(secret_header(&requests[0]), None);
}

#[tokio::test]
async fn test_send_post_error_carries_status_and_body() {
    let server = MockServer::start().await;
    respond_all(&server, ResponseTemplate::new(503).set_body_string("busy")).await;
    let (ctx, _rx) = setup(Config::default());

    let event = WebhookEvent::new("message.sent", serde_json::Value::Null);
    let err = ctx
        .dispatcher
        .send_post(&format!("{}/hook", server.uri()), &event)
        .await
        .unwrap_err();
    assert_eq!(err.status, Some(503));
    assert_eq!(err.body.as_deref(), Some("busy"));
}

#[tokio::test]
async fn test_heartbeat_success_emits_relay_found() {
    let server = MockServer::start().await;
    respond_all(&server, ResponseTemplate::new(200).set_body_string("ok")).await;
    let (ctx, mut rx) = setup(Config::default());
    ctx.webhooks
        .create(&format!("{}/hb", server.uri()), &events(&["*"]))
        .unwrap();

    ctx.dispatcher
        .dispatch(WebhookEvent::new("heartbeat", serde_json::json!({})));

    assert_eq!(next_signal(&mut rx).await, UiSignal::RelayFound);
}

#[tokio::test]
async fn test_heartbeat_marker_in_success_body_emits_relay_not_found() {
    let server = MockServer::start().await;
    respond_all(
        &server,
        ResponseTemplate::new(200).set_body_string(r#"{"error":"Could not get relay server"}"#),
    )
    .await;
    let (ctx, mut rx) = setup(Config::default());
    ctx.webhooks
        .create(&format!("{}/hb", server.uri()), &events(&["heartbeat"]))
        .unwrap();

    ctx.dispatcher
        .dispatch(WebhookEvent::new("heartbeat", serde_json::json!({})));

    assert!(matches!(
        next_signal(&mut rx).await,
        UiSignal::RelayNotFound { .. }
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "relay-found must not follow relay-not-found");
}

#[tokio::test]
async fn test_heartbeat_marker_in_error_body_emits_relay_not_found() {
    let server = MockServer::start().await;
    respond_all(
        &server,
        ResponseTemplate::new(404).set_body_string("could not get relay server for device"),
    )
    .await;
    let (ctx, mut rx) = setup(Config::default());
    ctx.webhooks
        .create(&format!("{}/hb", server.uri()), &events(&["*"]))
        .unwrap();

    ctx.dispatcher
        .dispatch(WebhookEvent::new("heartbeat", serde_json::json!({})));

    match next_signal(&mut rx).await {
        UiSignal::RelayNotFound { message } => assert!(!message.is_empty()),
        other => panic!("expected relay-not-found, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_failure_without_marker_is_silent() {
    let server = MockServer::start().await;
    respond_all(&server, ResponseTemplate::new(500).set_body_string("oops")).await;
    let (ctx, mut rx) = setup(Config::default());
    ctx.webhooks
        .create(&format!("{}/hb", server.uri()), &events(&["*"]))
        .unwrap();

    ctx.dispatcher
        .dispatch(WebhookEvent::new("heartbeat", serde_json::json!({})));

    wait_for_requests(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_non_heartbeat_marker_is_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("could not get relay server"))
        .mount(&server)
        .await;
    let (ctx, mut rx) = setup(Config::default());
    ctx.webhooks
        .create(&format!("{}/hook", server.uri()), &events(&["*"]))
        .unwrap();

    ctx.dispatcher
        .dispatch(WebhookEvent::new("message.sent", serde_json::Value::Null));

    wait_for_requests(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}
