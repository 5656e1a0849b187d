//! Webhook subscriber registrations.
//!
//! Registrations are kept in memory and persisted to `webhooks.json` so
//! they survive restarts. Ids are assigned monotonically and never reused
//! within one file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::constants::WEBHOOK_WILDCARD;

/// A registered subscriber endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    /// Local id.
    pub id: i64,
    /// Delivery URL.
    pub url: String,
    /// Event types delivered, or `"*"` for all.
    pub events: Vec<String>,
    /// Registration time.
    pub created: DateTime<Utc>,
}

impl Webhook {
    /// Whether this subscriber wants events of `event_type`.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.events
            .iter()
            .map(|e| e.trim())
            .any(|e| e == WEBHOOK_WILDCARD || e == event_type)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WebhookFile {
    next_id: i64,
    webhooks: Vec<Webhook>,
}

/// Persisted webhook registrations.
#[derive(Debug)]
pub struct WebhookStore {
    path: Option<PathBuf>,
    inner: RwLock<WebhookFile>,
}

impl WebhookStore {
    /// Open `webhooks.json` at `path`, starting empty if missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            WebhookFile::default()
        };
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(file),
        })
    }

    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: RwLock::new(WebhookFile::default()),
        }
    }

    fn save(&self, file: &WebhookFile) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        fs::write(path, serde_json::to_string_pretty(file)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// All registrations, oldest first.
    pub fn list(&self) -> Vec<Webhook> {
        match self.inner.read() {
            Ok(file) => file.webhooks.clone(),
            Err(poisoned) => poisoned.into_inner().webhooks.clone(),
        }
    }

    /// Registration with exactly this URL, if any.
    pub fn find_by_url(&self, url: &str) -> Option<Webhook> {
        self.list().into_iter().find(|w| w.url == url)
    }

    /// Register a subscriber.
    ///
    /// The URL must be http(s) and at least one non-blank event type given.
    pub fn create(&self, url: &str, events: &[String]) -> Result<Webhook> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("webhook url must start with http:// or https://");
        }
        let events: Vec<String> = events
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if events.is_empty() {
            anyhow::bail!("webhook must subscribe to at least one event type");
        }

        let mut file = self
            .inner
            .write()
            .map_err(|_poisoned| anyhow::anyhow!("webhook store lock poisoned"))?;
        let id = file.next_id.max(file.webhooks.iter().map(|w| w.id).max().unwrap_or(0)) + 1;
        let webhook = Webhook {
            id,
            url: url.to_string(),
            events,
            created: Utc::now(),
        };

        let mut next = WebhookFile {
            next_id: id,
            webhooks: file.webhooks.clone(),
        };
        next.webhooks.push(webhook.clone());
        self.save(&next)?;
        *file = next;

        log::info!("[Webhook] Registered #{} -> {}", webhook.id, webhook.url);
        Ok(webhook)
    }

    /// Remove a registration. Returns whether it existed.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let mut file = self
            .inner
            .write()
            .map_err(|_poisoned| anyhow::anyhow!("webhook store lock poisoned"))?;
        if !file.webhooks.iter().any(|w| w.id == id) {
            return Ok(false);
        }
        let next = WebhookFile {
            next_id: file.next_id,
            webhooks: file.webhooks.iter().filter(|w| w.id != id).cloned().collect(),
        };
        self.save(&next)?;
        *file = next;
        log::info!("[Webhook] Removed #{id}");
        Ok(true)
    }
}
