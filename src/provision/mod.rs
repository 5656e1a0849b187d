//! Device provisioning.
//!
//! Turns a single-use provisioning token into a fully onboarded device:
//! identity, decrypted credentials, a running tunnel, a control-plane device
//! record, a wildcard webhook and persisted linkage.
//!
//! # Flow
//!
//! ```text
//! Idle → TokenEntered → KeypairReady → Exchanging → SecretsDecrypting
//!      → TunnelInstalling → Registering → WebhookRegistering
//!      → ConfigPersisting → Complete
//! ```
//!
//! # Failure policy
//!
//! - Exchange or decryption failure burns the token. The session returns
//!   to `TokenEntered` without a token and nothing is persisted.
//! - Tunnel cancel/failure parks the session at
//!   `Failed { retry_from: TunnelInstalling }`. [`Provisioner::retry`]
//!   re-runs that step with the secrets already held in memory.
//! - Device and webhook registration failures are logged and skipped.
//!
//! Steps after the exchange are not atomic: a crash between tunnel install
//! and config persistence leaves a live tunnel without local credentials.

pub mod client;
pub mod state;
pub mod tunnel;

pub use client::{ControlPlaneClient, ExchangeRequest, ExchangeResponse, RegisterDeviceRequest};
pub use state::{ProvisionState, Step};
pub use tunnel::{CommandTunnelInstaller, TunnelInstaller, TunnelOutcome};

use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::config::ServerLinkage;
use crate::constants;
use crate::context::AppContext;
use crate::error::ProvisionError;
use crate::identity::DeviceIdentity;
use crate::sealed;
use crate::signals::{self, UiSignal};
use crate::vault::CredentialSet;

/// Secrets opened from the exchange response. Held only in memory.
struct DecryptedSecrets {
    password: Zeroizing<String>,
    tunnel_token: Zeroizing<String>,
    webhook_secret: Zeroizing<String>,
}

/// One provisioning attempt, owned by the caller between `run`/`retry`.
pub struct ProvisioningSession {
    state: ProvisionState,
    token: Option<Zeroizing<String>>,
    identity: Option<DeviceIdentity>,
    exchange: Option<ExchangeResponse>,
    secrets: Option<DecryptedSecrets>,
    last_error: Option<String>,
}

impl std::fmt::Debug for ProvisioningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningSession")
            .field("state", &self.state)
            .field("has_token", &self.token.is_some())
            .field("has_secrets", &self.secrets.is_some())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Default for ProvisioningSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningSession {
    /// A session waiting for a token.
    pub fn new() -> Self {
        Self {
            state: ProvisionState::Idle,
            token: None,
            identity: None,
            exchange: None,
            secrets: None,
            last_error: None,
        }
    }

    /// Accept a provisioning token.
    ///
    /// Only valid while idle or waiting for a fresh token; a token cannot be
    /// swapped in under a running or parked attempt.
    pub fn enter_token(&mut self, token: &str) -> Result<(), ProvisionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ProvisionError::Validation(
                "provisioning token must not be empty".to_string(),
            ));
        }
        if !matches!(self.state, ProvisionState::Idle | ProvisionState::TokenEntered) {
            return Err(ProvisionError::InvalidState {
                action: "enter a token",
                state: self.state.to_string(),
            });
        }
        self.token = Some(Zeroizing::new(token.to_string()));
        self.last_error = None;
        self.state = ProvisionState::TokenEntered;
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> ProvisionState {
        self.state
    }

    /// Whether a token is waiting to be exchanged.
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Message of the most recent failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Public address returned by the exchange, once known.
    pub fn server_address(&self) -> Option<&str> {
        self.exchange.as_ref().map(|e| e.host.as_str())
    }

    fn burn_token(&mut self) {
        self.token = None;
        self.exchange = None;
        self.secrets = None;
        self.state = ProvisionState::TokenEntered;
    }
}

/// Drives provisioning sessions against the control plane.
///
/// Share one `Provisioner` per process: the single-flight guard only
/// covers attempts made through the same instance.
#[derive(Debug)]
pub struct Provisioner {
    ctx: AppContext,
    client: ControlPlaneClient,
    tunnel: Arc<dyn TunnelInstaller>,
    in_flight: Mutex<()>,
}

impl Provisioner {
    /// Create a provisioner talking to the configured control plane.
    pub fn new(ctx: AppContext, tunnel: Arc<dyn TunnelInstaller>) -> Self {
        let client = ControlPlaneClient::new(ctx.http.clone(), &ctx.config.snapshot().control_plane_url);
        Self {
            ctx,
            client,
            tunnel,
            in_flight: Mutex::new(()),
        }
    }

    /// Start a session with `token` already entered.
    pub fn begin(&self, token: &str) -> Result<ProvisioningSession, ProvisionError> {
        let mut session = ProvisioningSession::new();
        session.enter_token(token)?;
        self.report(&session);
        Ok(session)
    }

    /// Run the session forward from its current state until it completes
    /// or a step fails.
    pub async fn run(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| ProvisionError::AlreadyInProgress)?;

        if session.state.is_terminal() {
            return Ok(());
        }
        match session.state {
            ProvisionState::TokenEntered if !session.has_token() => {
                return Err(ProvisionError::Validation(
                    "a fresh provisioning token is required".to_string(),
                ));
            }
            ProvisionState::Idle | ProvisionState::Failed { .. } => {
                return Err(ProvisionError::InvalidState {
                    action: "run",
                    state: session.state.to_string(),
                });
            }
            _ => {}
        }

        self.drive(session).await
    }

    /// Re-enter the step that failed. Earlier steps are not repeated.
    pub async fn retry(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| ProvisionError::AlreadyInProgress)?;

        let ProvisionState::Failed { retry_from } = session.state else {
            return Err(ProvisionError::InvalidState {
                action: "retry",
                state: session.state.to_string(),
            });
        };

        log::info!("[Provision] Retrying from {}", ProvisionState::from(retry_from));
        session.last_error = None;
        session.state = retry_from.into();
        self.drive(session).await
    }

    async fn drive(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        loop {
            let step = match session.state {
                ProvisionState::Complete => return Ok(()),
                ProvisionState::TokenEntered => {
                    session.state = ProvisionState::KeypairReady;
                    self.report(session);
                    continue;
                }
                state => match state.step() {
                    Some(step) => step,
                    None => {
                        return Err(ProvisionError::InvalidState {
                            action: "run",
                            state: state.to_string(),
                        })
                    }
                },
            };

            let result = match step {
                Step::KeypairReady => self.prepare_identity(session),
                Step::Exchanging => self.exchange(session).await,
                Step::SecretsDecrypting => self.decrypt(session),
                Step::TunnelInstalling => self.install_tunnel(session).await,
                Step::Registering => {
                    self.register_device(session).await;
                    Ok(())
                }
                Step::WebhookRegistering => {
                    self.register_webhook(session);
                    Ok(())
                }
                Step::ConfigPersisting => self.persist(session),
            };

            if let Err(err) = result {
                return Err(self.fail(session, step, err));
            }

            session.state = next_state(step);
            self.report(session);
        }
    }

    fn fail(&self, session: &mut ProvisioningSession, step: Step, err: ProvisionError) -> ProvisionError {
        log::error!("[Provision] {} failed: {err}", ProvisionState::from(step));
        match err {
            ProvisionError::Crypto(_) | ProvisionError::Transport(_)
                if matches!(step, Step::Exchanging | Step::SecretsDecrypting) =>
            {
                session.burn_token();
            }
            _ => session.state = ProvisionState::Failed { retry_from: step },
        }
        session.last_error = Some(err.to_string());
        self.report(session);
        err
    }

    fn report(&self, session: &ProvisioningSession) {
        signals::emit(&self.ctx.signals, UiSignal::Provisioning(session.state));
    }

    fn prepare_identity(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        let (identity, created) = self.ctx.vault.ensure_identity()?;
        if created {
            log::info!(
                "[Provision] Created device identity {} ({})",
                identity.device_id(),
                identity.fingerprint()
            );
        }
        session.identity = Some(identity);
        Ok(())
    }

    async fn exchange(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        let identity = require(session.identity.as_ref(), "device identity")?;
        let token = require(session.token.as_ref(), "provisioning token")?;
        let request = ExchangeRequest {
            token: token.as_str().to_string(),
            pubkey_b64: identity.public_key_base64(),
            device_name: self.ctx.config.snapshot().device_name(),
            device_id: identity.device_id().to_string(),
        };

        let response = self.client.exchange(&request).await?;
        log::info!(
            "[Provision] Exchanged token: server_id={} host={}",
            response.server_id,
            response.host
        );
        // Single use: the control plane has consumed it either way.
        session.token = None;
        session.exchange = Some(response);
        Ok(())
    }

    fn decrypt(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        let identity = require(session.identity.as_ref(), "device identity")?;
        let exchange = require(session.exchange.as_ref(), "exchange response")?;

        let secrets = DecryptedSecrets {
            password: sealed::open_base64_str(&exchange.sealed_password_b64, identity)?,
            tunnel_token: sealed::open_base64_str(&exchange.sealed_tunnel_token_b64, identity)?,
            webhook_secret: sealed::open_base64_str(&exchange.sealed_webhook_secret_b64, identity)?,
        };
        session.secrets = Some(secrets);
        Ok(())
    }

    async fn install_tunnel(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        let secrets = require(session.secrets.as_ref(), "decrypted secrets")?;
        match self.tunnel.install(&secrets.tunnel_token).await {
            TunnelOutcome::Installed => Ok(()),
            TunnelOutcome::Cancelled => Err(ProvisionError::PrivilegeCancelled),
            TunnelOutcome::Failed(reason) => Err(ProvisionError::TunnelFailed(reason)),
        }
    }

    async fn register_device(&self, session: &ProvisioningSession) {
        let (Some(identity), Some(exchange), Some(secrets)) =
            (&session.identity, &session.exchange, &session.secrets)
        else {
            log::warn!("[Provision] Skipping device registration: session incomplete");
            return;
        };

        let request = RegisterDeviceRequest {
            pubkey_b64: identity.public_key_base64(),
            device_id: identity.device_id().to_string(),
            relay_id: exchange.server_id.clone(),
        };
        match self.client.register_device(&secrets.password, &request).await {
            Ok(()) => log::info!("[Provision] Registered device {}", identity.device_id()),
            Err(e) => log::warn!("[Provision] Device registration failed (continuing): {e}"),
        }
    }

    fn register_webhook(&self, session: &ProvisioningSession) {
        let Some(exchange) = &session.exchange else {
            log::warn!("[Provision] Skipping webhook registration: no exchange response");
            return;
        };

        let url = self.client.webhook_ingest_url(&exchange.webhook_id);
        if self.ctx.webhooks.find_by_url(&url).is_some() {
            log::debug!("[Provision] Webhook {url} already registered");
            return;
        }
        match self
            .ctx
            .webhooks
            .create(&url, &[constants::WEBHOOK_WILDCARD.to_string()])
        {
            Ok(hook) => log::info!("[Provision] Registered webhook #{} -> {url}", hook.id),
            Err(e) => log::warn!("[Provision] Webhook registration failed (continuing): {e:#}"),
        }
    }

    fn persist(&self, session: &mut ProvisioningSession) -> Result<(), ProvisionError> {
        let exchange = require(session.exchange.as_ref(), "exchange response")?;
        let secrets = require(session.secrets.as_ref(), "decrypted secrets")?;

        self.ctx.vault.store_credentials(&CredentialSet {
            server_password: Some(secrets.password.as_str().to_string()),
            webhook_secret: Some(secrets.webhook_secret.as_str().to_string()),
        })?;

        let linkage = ServerLinkage {
            server_id: Some(exchange.server_id.clone()),
            server_address: Some(exchange.host.clone()),
            webhook_id: Some(exchange.webhook_id.clone()),
        };
        let user_email = exchange.user_email.clone();
        self.ctx
            .config
            .update(|config| {
                config.linkage = linkage;
                if user_email.is_some() {
                    config.user_email = user_email;
                }
                config.onboarding_complete = true;
            })
            .map_err(|e| ProvisionError::Config(format!("{e:#}")))?;

        session.secrets = None;
        log::info!("[Provision] Onboarding complete");
        Ok(())
    }
}

fn next_state(step: Step) -> ProvisionState {
    match step {
        Step::KeypairReady => ProvisionState::Exchanging,
        Step::Exchanging => ProvisionState::SecretsDecrypting,
        Step::SecretsDecrypting => ProvisionState::TunnelInstalling,
        Step::TunnelInstalling => ProvisionState::Registering,
        Step::Registering => ProvisionState::WebhookRegistering,
        Step::WebhookRegistering => ProvisionState::ConfigPersisting,
        Step::ConfigPersisting => ProvisionState::Complete,
    }
}

fn require<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T, ProvisionError> {
    value.ok_or_else(|| ProvisionError::Validation(format!("{what} missing from session")))
}
