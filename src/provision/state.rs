//! Provisioning states.

use std::fmt;

/// A step that performs work and can be retried after it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Load or create the device identity.
    KeypairReady,
    /// Trade the provisioning token for sealed secrets.
    Exchanging,
    /// Open the sealed secrets with the device key.
    SecretsDecrypting,
    /// Hand the tunnel token to the tunnel installer.
    TunnelInstalling,
    /// Register the device with the control plane (best effort).
    Registering,
    /// Subscribe the control plane to all local events (best effort).
    WebhookRegistering,
    /// Write credentials and linkage, mark onboarding complete.
    ConfigPersisting,
}

/// Where a provisioning session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionState {
    /// Nothing entered yet.
    Idle,
    /// A token is present (or a fresh one is required after a burned token).
    TokenEntered,
    /// See [`Step::KeypairReady`].
    KeypairReady,
    /// See [`Step::Exchanging`].
    Exchanging,
    /// See [`Step::SecretsDecrypting`].
    SecretsDecrypting,
    /// See [`Step::TunnelInstalling`].
    TunnelInstalling,
    /// See [`Step::Registering`].
    Registering,
    /// See [`Step::WebhookRegistering`].
    WebhookRegistering,
    /// See [`Step::ConfigPersisting`].
    ConfigPersisting,
    /// Onboarding finished.
    Complete,
    /// A step failed; a manual retry re-enters `retry_from`.
    Failed {
        /// Step to re-run on retry.
        retry_from: Step,
    },
}

impl From<Step> for ProvisionState {
    fn from(step: Step) -> Self {
        match step {
            Step::KeypairReady => Self::KeypairReady,
            Step::Exchanging => Self::Exchanging,
            Step::SecretsDecrypting => Self::SecretsDecrypting,
            Step::TunnelInstalling => Self::TunnelInstalling,
            Step::Registering => Self::Registering,
            Step::WebhookRegistering => Self::WebhookRegistering,
            Step::ConfigPersisting => Self::ConfigPersisting,
        }
    }
}

impl ProvisionState {
    /// The working step this state represents, if any.
    pub fn step(self) -> Option<Step> {
        match self {
            Self::KeypairReady => Some(Step::KeypairReady),
            Self::Exchanging => Some(Step::Exchanging),
            Self::SecretsDecrypting => Some(Step::SecretsDecrypting),
            Self::TunnelInstalling => Some(Step::TunnelInstalling),
            Self::Registering => Some(Step::Registering),
            Self::WebhookRegistering => Some(Step::WebhookRegistering),
            Self::ConfigPersisting => Some(Step::ConfigPersisting),
            Self::Idle | Self::TokenEntered | Self::Complete | Self::Failed { .. } => None,
        }
    }

    /// Whether no further transitions happen without new input.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::TokenEntered => write!(f, "token entered"),
            Self::KeypairReady => write!(f, "preparing device keypair"),
            Self::Exchanging => write!(f, "exchanging provisioning token"),
            Self::SecretsDecrypting => write!(f, "decrypting secrets"),
            Self::TunnelInstalling => write!(f, "installing tunnel"),
            Self::Registering => write!(f, "registering device"),
            Self::WebhookRegistering => write!(f, "registering webhook"),
            Self::ConfigPersisting => write!(f, "saving configuration"),
            Self::Complete => write!(f, "complete"),
            Self::Failed { retry_from } => {
                write!(f, "failed at {}", ProvisionState::from(*retry_from))
            }
        }
    }
}
