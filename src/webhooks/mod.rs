//! Webhook registrations and outbound delivery.

pub mod dispatch;
pub mod store;

pub use dispatch::{DeliveryOutcome, DeliveryResponse, WebhookDispatcher, WebhookEvent};
pub use store::{Webhook, WebhookStore};
