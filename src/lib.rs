//! Tether - local relay agent.
//!
//! This crate bridges a personal device to a remote control plane: it
//! provisions a device identity, guards the local API with the provisioned
//! password and relays signed webhook events, reporting liveness through
//! periodic heartbeats.
//!
//! # Architecture
//!
//! Every component receives an explicit [`AppContext`] rather than reaching
//! for globals:
//!
//! - **Vault** - device identity and credentials over a [`keyring::SecretStore`]
//! - **Provisioner** - token exchange, sealed-secret decryption, tunnel install
//! - **Auth gate** - axum middleware in front of protected routes
//! - **Dispatcher** - fire-and-forget webhook fan-out with heartbeat interpretation
//! - **Heartbeat monitor** - scheduled liveness snapshots
//!
//! # Modules
//!
//! - [`provision`] - onboarding state machine and control-plane client
//! - [`sealed`] - anonymous sealed boxes
//! - [`server`] - local HTTP API
//! - [`webhooks`] - registrations and delivery
//! - [`config`] - configuration loading/saving

pub mod auth;
pub mod commands;
pub mod context;
pub mod heartbeat;
pub mod provision;
pub mod server;
pub mod signals;
pub mod webhooks;

pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod identity;
pub mod keyring;
pub mod sealed;
pub mod vault;

// Re-export commonly used types
pub use config::{Config, ConfigStore};
pub use context::AppContext;
pub use identity::DeviceIdentity;
pub use provision::{ProvisionState, Provisioner, ProvisioningSession};
pub use signals::UiSignal;
pub use vault::Vault;
