//! Control-plane HTTP client for provisioning.
//!
//! Two calls:
//! - `POST /api/v1/provision/exchange` trades a single-use token for
//!   sealed secrets addressed to the device public key.
//! - `POST /api/v1/devices` registers the device, authenticated with the
//!   freshly decrypted password.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TransportError;

/// Body of the token exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRequest {
    /// Single-use provisioning token.
    pub token: String,
    /// Device X25519 public key, base64.
    pub pubkey_b64: String,
    /// Human-readable device name.
    pub device_name: String,
    /// Stable device id.
    pub device_id: String,
}

/// Sealed secrets and linkage returned by the exchange.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExchangeResponse {
    /// Public address of the tunnel.
    pub host: String,
    /// Relay record id.
    #[serde(deserialize_with = "string_or_number")]
    pub server_id: String,
    /// Control-plane webhook ingestion id.
    #[serde(deserialize_with = "string_or_number")]
    pub webhook_id: String,
    /// Sealed local API password.
    pub sealed_password_b64: String,
    /// Sealed tunnel credential.
    pub sealed_tunnel_token_b64: String,
    /// Sealed webhook signing secret.
    pub sealed_webhook_secret_b64: String,
    /// Owner account email.
    #[serde(default)]
    pub user_email: Option<String>,
}

/// Body of the device registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterDeviceRequest {
    /// Device X25519 public key, base64.
    pub pubkey_b64: String,
    /// Stable device id.
    pub device_id: String,
    /// Relay record id from the exchange.
    pub relay_id: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Client for the control plane's provisioning endpoints.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Create a client for `base_url` (trailing slashes ignored).
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base URL of the control plane.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL the control plane ingests this device's webhook events on.
    pub fn webhook_ingest_url(&self, webhook_id: &str) -> String {
        format!("{}/api/v1/webhooks/{}", self.base_url, webhook_id)
    }

    /// Trade a provisioning token for sealed secrets.
    pub async fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        let url = format!("{}/api/v1/provision/exchange", self.base_url);
        log::debug!("[Provision] POST {url} device_id={}", request.device_id);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest("token exchange", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status("token exchange", status.as_u16(), body));
        }

        response.json().await.map_err(|e| TransportError {
            status: Some(status.as_u16()),
            body: None,
            message: format!("token exchange: invalid response: {e}"),
        })
    }

    /// Register the device using the server password as a bearer credential.
    pub async fn register_device(
        &self,
        password: &str,
        request: &RegisterDeviceRequest,
    ) -> Result<(), TransportError> {
        let url = format!("{}/api/v1/devices", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(password)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest("device registration", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(
                "device registration",
                status.as_u16(),
                body,
            ));
        }
        Ok(())
    }
}
