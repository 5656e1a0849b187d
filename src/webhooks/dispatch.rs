//! Outbound webhook delivery.
//!
//! Every dispatched event fans out to the matching subscribers as
//! independently spawned tasks. Nothing is joined back to the caller:
//! delivery is at-most-once, failures are logged and dropped, and there is
//! no ordering between endpoints or between successive events.
//!
//! Heartbeats get one extra step. The control plane answers a heartbeat for
//! a deleted relay with a body containing "could not get relay server"
//! (sometimes with a 200, sometimes with an error status), so the body is
//! searched for that marker and the result surfaced to the UI as
//! `relay-not-found` / `relay-found`.

// TODO: switch to a structured error code once the control plane exposes one for missing relays.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::store::{Webhook, WebhookStore};
use crate::config::ConfigStore;
use crate::constants::{
    HEARTBEAT_EVENT, RELAY_NOT_FOUND_MARKER, RELAY_NOT_FOUND_MESSAGE, WEBHOOK_SECRET_HEADER,
};
use crate::error::TransportError;
use crate::signals::{emit, SignalSender, UiSignal};
use crate::vault::Vault;

/// An event delivered to subscribers as `{type, data}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Event type, e.g. `message.sent` or `heartbeat`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: serde_json::Value,
}

impl WebhookEvent {
    /// Build an event.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// Whether this is a liveness heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.event_type == HEARTBEAT_EVENT
    }
}

/// A completed delivery with a success status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status.
    pub status: u16,
    /// Response body as text.
    pub body: String,
}

/// Raw outcome of one POST.
pub type DeliveryOutcome = Result<DeliveryResponse, TransportError>;

/// Whether a response or error text carries the relay-not-found marker.
pub fn indicates_relay_not_found(text: &str) -> bool {
    text.to_lowercase().contains(RELAY_NOT_FOUND_MARKER)
}

#[derive(Debug)]
struct DispatcherInner {
    client: Client,
    webhooks: Arc<WebhookStore>,
    vault: Vault,
    config: Arc<ConfigStore>,
    signals: SignalSender,
}

/// Fans events out to registered webhooks.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    inner: Arc<DispatcherInner>,
}

impl WebhookDispatcher {
    /// Create a dispatcher reading subscribers from `webhooks` and the
    /// signing secret from `vault` (falling back to legacy config).
    pub fn new(
        client: Client,
        webhooks: Arc<WebhookStore>,
        vault: Vault,
        config: Arc<ConfigStore>,
        signals: SignalSender,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                client,
                webhooks,
                vault,
                config,
                signals,
            }),
        }
    }

    /// Start one delivery per matching subscriber and return how many were
    /// started. Must be called from within a Tokio runtime.
    pub fn dispatch(&self, event: WebhookEvent) -> usize {
        let targets: Vec<Webhook> = self
            .inner
            .webhooks
            .list()
            .into_iter()
            .filter(|hook| hook.accepts(&event.event_type))
            .collect();

        if targets.is_empty() {
            log::debug!("[Webhook] No subscribers for {}", event.event_type);
            return 0;
        }

        let event = Arc::new(event);
        for hook in &targets {
            let this = self.clone();
            let event = Arc::clone(&event);
            let url = hook.url.clone();
            tokio::spawn(async move {
                let outcome = this.send_post(&url, &event).await;
                this.interpret(&url, &event, &outcome);
            });
        }
        targets.len()
    }

    /// Resolve the signing secret: vault first, then legacy config.
    ///
    /// Absence is tolerated; the delivery goes out unsigned.
    fn webhook_secret(&self) -> Option<String> {
        match self.inner.vault.get_webhook_secret() {
            Ok(Some(secret)) => return Some(secret),
            Ok(None) => {}
            Err(e) => log::warn!("[Webhook] Could not read webhook secret: {e}"),
        }
        self.inner
            .config
            .snapshot()
            .legacy_webhook_secret()
            .map(str::to_string)
    }

    /// POST `event` to `url` and return the raw outcome.
    ///
    /// Non-2xx responses come back as [`TransportError`] with status and body.
    pub async fn send_post(&self, url: &str, event: &WebhookEvent) -> DeliveryOutcome {
        let mut request = self.inner.client.post(url).json(event);
        match self.webhook_secret() {
            Some(secret) => {
                request = request.header(WEBHOOK_SECRET_HEADER, format!("Bearer {secret}"));
            }
            None => log::debug!("[Webhook] No webhook secret configured, sending unsigned"),
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest("webhook delivery", &e))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if (200..300).contains(&status) {
            Ok(DeliveryResponse { status, body })
        } else {
            Err(TransportError::from_status("webhook delivery", status, body))
        }
    }

    fn interpret(&self, url: &str, event: &WebhookEvent, outcome: &DeliveryOutcome) {
        if event.is_heartbeat() {
            let text = match outcome {
                Ok(response) => response.body.as_str(),
                Err(err) => err.text(),
            };
            if indicates_relay_not_found(text) {
                log::warn!("[Heartbeat] Control plane could not find this relay ({url})");
                emit(
                    &self.inner.signals,
                    UiSignal::RelayNotFound {
                        message: RELAY_NOT_FOUND_MESSAGE.to_string(),
                    },
                );
            } else if outcome.is_ok() {
                log::debug!("[Heartbeat] Delivered to {url}");
                emit(&self.inner.signals, UiSignal::RelayFound);
            } else if let Err(err) = outcome {
                log::warn!("[Heartbeat] Delivery to {url} failed: {err}");
            }
            return;
        }

        match outcome {
            Ok(response) => log::debug!(
                "[Webhook] {} delivered to {url} ({})",
                event.event_type,
                response.status
            ),
            Err(err) => log::debug!("[Webhook] {} to {url} failed: {err}", event.event_type),
        }
    }
}
