//! CLI subcommand implementations for tether.
//!
//! - [`provision`] - exchange a provisioning token and onboard this device
//! - [`serve`] - run the local API and heartbeat monitor
//! - [`status`] - print identity, linkage and webhook state
//! - [`reset`] - remove credentials and local state
//!
//! Every command resolves the config directory and opens an
//! [`AppContext`](crate::context::AppContext) itself.

pub mod provision;
pub mod reset;
pub mod serve;
pub mod status;
