//! Application-wide constants for tether.
//!
//! Centralizes magic numbers and protocol strings, grouped by domain.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for control-plane and webhook calls.
///
/// A stuck call is bounded here; no step has its own cancellation path.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for the local private-API reachability probe.
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Heartbeat
// ============================================================================

/// Delay before the first heartbeat after `start()`.
///
/// Keeps a fleet of agents restarting together from heartbeating at once.
pub const HEARTBEAT_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Period between heartbeats after the first one.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Event type that receives relay-liveness interpretation.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Case-insensitive marker the control plane returns when the relay record is gone.
pub const RELAY_NOT_FOUND_MARKER: &str = "could not get relay server";

/// User-facing message attached to the relay-not-found signal.
pub const RELAY_NOT_FOUND_MESSAGE: &str =
    "The control plane no longer recognizes this device. Re-provision with a new token to reconnect.";

// ============================================================================
// Webhooks
// ============================================================================

/// Header carrying the webhook signing secret on outbound deliveries.
pub const WEBHOOK_SECRET_HEADER: &str = "X-Webhook-Secret";

/// Wildcard event type matching every event.
pub const WEBHOOK_WILDCARD: &str = "*";

// ============================================================================
// Local API
// ============================================================================

/// Default bind address for the local API.
pub const DEFAULT_API_HOST: &str = "127.0.0.1";

/// Default port for the local API.
pub const DEFAULT_API_PORT: u16 = 1234;

/// Default control-plane base URL.
pub const DEFAULT_CONTROL_PLANE_URL: &str = "https://api.tether.sh";

// ============================================================================
// Secret store layout
// ============================================================================

/// Namespace holding the device keypair and id.
pub const NS_IDENTITY: &str = "identity";

/// Namespace holding the provisioned credential set.
pub const NS_SERVER: &str = "server";
