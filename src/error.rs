//! Error taxonomy shared across the provisioning, auth and relay paths.
//!
//! Each variant maps onto a distinct propagation policy: crypto failures
//! burn the provisioning token, transport failures are fatal only during
//! the exchange, and auth failures must stay distinguishable from server
//! misconfiguration.

use thiserror::Error;

/// Secure backing store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The OS credential vault refused access (locked, permission denied, no backend).
    #[error("secure store unavailable: {0}")]
    Unavailable(String),
    /// Data exists but could not be decoded.
    #[error("secure store data corrupted: {0}")]
    Corrupted(String),
}

/// Sealed-box open/seal failure. Never carries partial plaintext.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("decryption failed: {0}")]
pub struct CryptoError(pub String);

/// HTTP failure during exchange, registration or delivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    /// Response body, when one could be read.
    pub body: Option<String>,
    /// Human-readable summary.
    pub message: String,
}

impl TransportError {
    /// Error for a request that never produced a response.
    pub fn from_reqwest(context: &str, err: &reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            body: None,
            message: format!("{context}: {err}"),
        }
    }

    /// Error for a non-success response.
    pub fn from_status(context: &str, status: u16, body: String) -> Self {
        Self {
            status: Some(status),
            message: format!("{context}: HTTP {status}: {body}"),
            body: Some(body),
        }
    }

    /// Text available for inspection: the body if any, otherwise the message.
    pub fn text(&self) -> &str {
        self.body.as_deref().unwrap_or(&self.message)
    }
}

/// Rejections produced by the auth gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No candidate credential in the header or legacy query parameters.
    #[error("missing credential")]
    MissingCredential,
    /// Candidate does not match the canonical password.
    #[error("invalid credential")]
    InvalidCredential,
    /// No canonical password is configured; the server is not provisioned.
    #[error("server misconfigured: no password configured")]
    Misconfigured,
    /// The credential store could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the provisioning flow.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Missing or malformed required input.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A sealed secret could not be opened; a fresh token is required.
    #[error("could not decrypt provisioning secrets ({0}); request a new provisioning token")]
    Crypto(#[from] CryptoError),
    /// HTTP failure talking to the control plane.
    #[error("control plane request failed: {0}")]
    Transport(#[from] TransportError),
    /// The user declined the OS elevation prompt during tunnel install.
    #[error("tunnel installation was cancelled at the permission prompt; approve it and retry")]
    PrivilegeCancelled,
    /// The tunnel installer reported failure.
    #[error("tunnel installation failed: {0}")]
    TunnelFailed(String),
    /// Secure store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Configuration could not be persisted.
    #[error("could not persist configuration: {0}")]
    Config(String),
    /// Another provisioning attempt holds the single-flight guard.
    #[error("a provisioning attempt is already in progress")]
    AlreadyInProgress,
    /// The requested transition is not valid from the session's current state.
    #[error("cannot {action} while provisioning is {state}")]
    InvalidState {
        /// Attempted action.
        action: &'static str,
        /// State name at the time of the attempt.
        state: String,
    },
}
