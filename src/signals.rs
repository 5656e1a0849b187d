//! Signals pushed from the relay core to whatever UI is attached.
//!
//! The core never renders anything; it emits [`UiSignal`]s on an unbounded
//! channel. A headless `serve` drains them into the log.

use tokio::sync::mpsc;

use crate::provision::ProvisionState;

/// Event surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiSignal {
    /// A heartbeat round trip succeeded and the control plane knows this relay.
    RelayFound,
    /// The control plane reported that this device's relay record is gone.
    RelayNotFound {
        /// User-facing explanation.
        message: String,
    },
    /// Provisioning moved to a new state.
    Provisioning(ProvisionState),
}

impl UiSignal {
    /// Wire name used by UIs that key on strings.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RelayFound => "relay-found",
            Self::RelayNotFound { .. } => "relay-not-found",
            Self::Provisioning(_) => "provisioning",
        }
    }
}

/// Sending half of the UI signal channel.
pub type SignalSender = mpsc::UnboundedSender<UiSignal>;
/// Receiving half of the UI signal channel.
pub type SignalReceiver = mpsc::UnboundedReceiver<UiSignal>;

/// Create a signal channel.
pub fn channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Send without caring whether a UI is attached.
pub(crate) fn emit(tx: &SignalSender, signal: UiSignal) {
    if let Err(e) = tx.send(signal) {
        log::debug!("No UI attached, dropped signal {}", e.0.name());
    }
}

/// Drain signals into the log until every sender is dropped.
pub async fn log_signals(mut rx: SignalReceiver) {
    while let Some(signal) = rx.recv().await {
        match &signal {
            UiSignal::RelayFound => log::info!("[Relay] relay-found"),
            UiSignal::RelayNotFound { message } => log::warn!("[Relay] relay-not-found: {message}"),
            UiSignal::Provisioning(state) => log::info!("[Provision] {state}"),
        }
    }
}
