//! Explicit application context.
//!
//! Everything the provisioning flow, auth gate, dispatcher and heartbeat
//! monitor share is owned here and handed to them, never reached through
//! globals.

use anyhow::Result;
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;

use crate::config::ConfigStore;
use crate::constants;
use crate::keyring::{self, SecretStore};
use crate::signals::{self, SignalReceiver, SignalSender};
use crate::vault::Vault;
use crate::webhooks::{WebhookDispatcher, WebhookStore};

/// Shared services for one agent process.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Identity and credentials.
    pub vault: Vault,
    /// Non-secret configuration.
    pub config: Arc<ConfigStore>,
    /// Webhook registrations.
    pub webhooks: Arc<WebhookStore>,
    /// Outbound delivery.
    pub dispatcher: WebhookDispatcher,
    /// UI signal channel.
    pub signals: SignalSender,
    /// HTTP client shared by control-plane calls.
    pub http: Client,
}

impl AppContext {
    /// Assemble a context from its parts. Returns the receiving end of the
    /// UI signal channel alongside it.
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        config: ConfigStore,
        webhooks: WebhookStore,
    ) -> Result<(Self, SignalReceiver)> {
        let http = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;
        let (tx, rx) = signals::channel();
        let vault = Vault::new(secrets);
        let config = Arc::new(config);
        let webhooks = Arc::new(webhooks);
        let dispatcher = WebhookDispatcher::new(
            http.clone(),
            Arc::clone(&webhooks),
            vault.clone(),
            Arc::clone(&config),
            tx.clone(),
        );

        Ok((
            Self {
                vault,
                config,
                webhooks,
                dispatcher,
                signals: tx,
                http,
            },
            rx,
        ))
    }

    /// Open the on-disk context under `config_dir` with the environment's
    /// default secret store.
    pub fn open(config_dir: &Path) -> Result<(Self, SignalReceiver)> {
        Self::new(
            keyring::default_store(config_dir),
            ConfigStore::open(config_dir.join("config.json"))?,
            WebhookStore::open(config_dir.join("webhooks.json"))?,
        )
    }
}
