//! Local HTTP API.
//!
//! # Routes
//!
//! | Route | Auth |
//! |---|---|
//! | `GET /api/v1/health` | none |
//! | `GET /api/v1/ping` | password |
//! | `GET /api/v1/server/info` | password |
//! | `GET /api/v1/webhook` | password |
//! | `POST /api/v1/webhook` | password |
//! | `DELETE /api/v1/webhook/{id}` | password |
//!
//! Protected routes sit behind [`auth::require_password`]. Errors use the
//! same `{status, error: {type, message}}` envelope as the auth gate.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{middleware, Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::auth;
use crate::config::ServerLinkage;
use crate::context::AppContext;
use crate::identity;
use crate::webhooks::Webhook;

/// Handler error rendered as a JSON envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(err: &anyhow::Error) -> Self {
        log::error!("[Api] {err:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = match self.status {
            StatusCode::BAD_REQUEST => "ValidationError",
            StatusCode::NOT_FOUND => "NotFound",
            _ => "ServerError",
        };
        let body = serde_json::json!({
            "status": self.status.as_u16(),
            "error": { "type": kind, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

/// Body of `POST /api/v1/webhook`.
#[derive(Debug, Deserialize)]
pub struct CreateWebhook {
    /// Delivery URL.
    pub url: String,
    /// Event types, or `["*"]`.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Body of `GET /api/v1/server/info`.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// Agent version.
    pub version: &'static str,
    /// Device id, if an identity exists.
    pub device_id: Option<String>,
    /// Public key fingerprint.
    pub fingerprint: Option<String>,
    /// Control-plane linkage.
    pub linkage: ServerLinkage,
    /// Account email.
    pub user_email: Option<String>,
    /// Whether provisioning finished.
    pub onboarding_complete: bool,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "pong" }))
}

async fn server_info(State(ctx): State<AppContext>) -> Json<ServerInfo> {
    let config = ctx.config.snapshot();
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION"),
        device_id: ctx.vault.get_device_id(),
        fingerprint: ctx.vault.get_public_key().map(|key| identity::fingerprint(&key)),
        linkage: config.linkage,
        user_email: config.user_email,
        onboarding_complete: config.onboarding_complete,
    })
}

async fn list_webhooks(State(ctx): State<AppContext>) -> Json<Vec<Webhook>> {
    Json(ctx.webhooks.list())
}

async fn create_webhook(
    State(ctx): State<AppContext>,
    Json(body): Json<CreateWebhook>,
) -> Result<(StatusCode, Json<Webhook>), ApiError> {
    ctx.webhooks
        .create(&body.url, &body.events)
        .map(|hook| (StatusCode::CREATED, Json(hook)))
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))
}

async fn delete_webhook(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    match ctx.webhooks.delete(id) {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(ApiError::not_found(format!("webhook {id} not found"))),
        Err(e) => Err(ApiError::internal(&e)),
    }
}

/// Build the API router.
pub fn router(ctx: AppContext) -> Router {
    let protected = Router::new()
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/server/info", get(server_info))
        .route("/api/v1/webhook", get(list_webhooks).post(create_webhook))
        .route("/api/v1/webhook/{id}", delete(delete_webhook))
        .route_layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_password,
        ));

    Router::new()
        .route("/api/v1/health", get(health))
        .merge(protected)
        .with_state(ctx)
}

/// Bind the configured address.
pub async fn bind(ctx: &AppContext) -> Result<TcpListener> {
    let config = ctx.config.snapshot();
    let addr = format!("{}:{}", config.api_host, config.api_port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind local API on {addr}"))
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    ctx: AppContext,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    log::info!("[Api] Listening on http://{addr}");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Local API server failed")
}
