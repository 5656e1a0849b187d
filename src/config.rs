//! Configuration loading and persistence.
//!
//! Non-secret settings live in `config.json` under the config directory:
//! the control-plane URL, local API bind address, heartbeat timing, health
//! probe targets and the [`ServerLinkage`] written at the end of
//! provisioning. Secrets live in the OS keyring via [`crate::vault`].
//!
//! `password` and `webhook_secret` here are legacy plaintext fields from
//! installs that predate keyring storage. They are read only as a fallback
//! and never written by provisioning.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use crate::constants;

/// Non-secret link between this device and its control-plane relay.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerLinkage {
    /// Control-plane id of this device's relay record.
    pub server_id: Option<String>,
    /// Public address the tunnel exposes this agent on.
    pub server_address: Option<String>,
    /// Control-plane webhook ingestion id.
    pub webhook_id: Option<String>,
}

/// Configuration for the tether agent.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Base URL of the control plane.
    pub control_plane_url: String,
    /// Local API bind host.
    pub api_host: String,
    /// Local API port.
    pub api_port: u16,
    /// Device name reported at provisioning (defaults to hostname).
    pub device_name: Option<String>,
    /// Link written by provisioning.
    pub linkage: ServerLinkage,
    /// Account email returned by the control plane.
    pub user_email: Option<String>,
    /// Set once provisioning has persisted everything.
    pub onboarding_complete: bool,
    /// Legacy plaintext API password (fallback only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// `TETHER_PASSWORD`, never written back to disk.
    #[serde(skip)]
    pub env_password: Option<String>,
    /// Legacy plaintext webhook secret (fallback only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Seconds before the first heartbeat.
    pub heartbeat_initial_delay_secs: u64,
    /// Seconds between heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Command that installs the tunnel; the decrypted token is appended.
    pub tunnel_command: Vec<String>,
    /// Path whose readability proves full-disk access was granted.
    pub messages_db_path: Option<PathBuf>,
    /// Localhost port of the private-API helper.
    pub private_api_port: Option<u16>,
    /// Process names whose liveness is reported in heartbeats.
    pub watched_processes: Vec<String>,
    /// Account identifiers detected by the host application.
    pub accounts: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_plane_url: constants::DEFAULT_CONTROL_PLANE_URL.to_string(),
            api_host: constants::DEFAULT_API_HOST.to_string(),
            api_port: constants::DEFAULT_API_PORT,
            device_name: None,
            linkage: ServerLinkage::default(),
            user_email: None,
            onboarding_complete: false,
            password: None,
            env_password: None,
            webhook_secret: None,
            heartbeat_initial_delay_secs: constants::HEARTBEAT_INITIAL_DELAY.as_secs(),
            heartbeat_interval_secs: constants::HEARTBEAT_INTERVAL.as_secs(),
            tunnel_command: vec![
                "cloudflared".to_string(),
                "service".to_string(),
                "install".to_string(),
            ],
            messages_db_path: None,
            private_api_port: None,
            watched_processes: Vec::new(),
            accounts: Vec::new(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `TETHER_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (macOS: ~/Library/Application Support/tether)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom_dir) = std::env::var("TETHER_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join(crate::env::APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load `config.json` from `path`, defaulting when missing, then apply
    /// environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TETHER_CONTROL_PLANE_URL") {
            self.control_plane_url = url;
        }

        if let Ok(port) = std::env::var("TETHER_API_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.api_port = port;
            }
        }

        // Legacy password from env var (headless installs)
        if let Ok(password) = std::env::var("TETHER_PASSWORD") {
            self.env_password = Some(password);
        }

        if let Ok(interval) = std::env::var("TETHER_HEARTBEAT_INTERVAL") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.heartbeat_interval_secs = secs;
            }
        }
    }

    /// Persist to `path` with owner-only permissions.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Device name to report, falling back to the hostname.
    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(crate::identity::default_device_name)
    }

    /// Delay before the first heartbeat.
    pub fn heartbeat_initial_delay(&self) -> Duration {
        Duration::from_secs(self.heartbeat_initial_delay_secs)
    }

    /// Heartbeat period (never zero).
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Legacy password, ignoring blanks.
    pub fn legacy_password(&self) -> Option<&str> {
        self.env_password
            .as_deref()
            .or(self.password.as_deref())
            .filter(|p| !p.trim().is_empty())
    }

    /// Legacy webhook secret, ignoring blanks.
    pub fn legacy_webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Shared, persisted configuration.
///
/// Readers take cheap snapshots; writers mutate and save atomically under
/// the write lock.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    inner: RwLock<Config>,
}

impl ConfigStore {
    /// Open `config.json` at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(config),
        })
    }

    /// Store that is never written to disk (tests, dry runs).
    pub fn in_memory(config: Config) -> Self {
        Self {
            path: None,
            inner: RwLock::new(config),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the current configuration.
    pub fn snapshot(&self) -> Config {
        match self.inner.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether provisioning has completed.
    pub fn onboarding_complete(&self) -> bool {
        self.snapshot().onboarding_complete
    }

    /// Apply `f` and persist. The in-memory value is only replaced if the
    /// save succeeds.
    pub fn update(&self, f: impl FnOnce(&mut Config)) -> Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_poisoned| anyhow::anyhow!("config lock poisoned"))?;
        let mut next = guard.clone();
        f(&mut next);
        if let Some(path) = &self.path {
            next.save_to(path)?;
        }
        *guard = next;
        Ok(())
    }
}
