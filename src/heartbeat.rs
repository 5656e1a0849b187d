//! Heartbeat monitor.
//!
//! Once onboarding is complete the agent reports a liveness snapshot to
//! every subscribed webhook on a fixed schedule: one heartbeat after the
//! initial delay, then one per interval until stopped. The dispatcher turns
//! the control plane's answers into `relay-found` / `relay-not-found`.
//!
//! Host health comes from a [`HealthProbe`]. [`SystemProbe`] checks the
//! local machine; tests substitute a fixed report.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::ConfigStore;
use crate::constants::{HEARTBEAT_EVENT, PROBE_CONNECT_TIMEOUT};
use crate::context::AppContext;
use crate::vault::Vault;
use crate::webhooks::{WebhookDispatcher, WebhookEvent};

/// Host health as observed by a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Whether the private-API helper accepted a connection.
    pub private_api_connected: bool,
    /// Whether the message database is readable.
    pub disk_access: bool,
    /// Accounts detected on the host.
    pub accounts: Vec<String>,
    /// Liveness of each watched process.
    pub processes: BTreeMap<String, bool>,
}

/// Payload of a `heartbeat` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatSnapshot {
    /// Seconds since the monitor started.
    pub uptime_secs: u64,
    /// See [`HealthReport::private_api_connected`].
    pub private_api_connected: bool,
    /// See [`HealthReport::disk_access`].
    pub disk_access: bool,
    /// See [`HealthReport::accounts`].
    pub accounts: Vec<String>,
    /// See [`HealthReport::processes`].
    pub processes: BTreeMap<String, bool>,
    /// Device id, if an identity exists.
    pub device_id: Option<String>,
    /// Agent version.
    pub version: String,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatSnapshot {
    fn new(report: HealthReport, uptime_secs: u64, device_id: Option<String>) -> Self {
        Self {
            uptime_secs,
            private_api_connected: report.private_api_connected,
            disk_access: report.disk_access,
            accounts: report.accounts,
            processes: report.processes,
            device_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Source of host health for heartbeats.
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    /// Inspect the host.
    async fn check(&self) -> HealthReport;
}

/// Probes the local machine using the configured paths, port and processes.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    config: Arc<ConfigStore>,
}

impl SystemProbe {
    /// Create a probe reading its targets from `config` on every check.
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }
}

async fn can_read(path: Option<PathBuf>) -> bool {
    match path {
        Some(path) => tokio::fs::File::open(&path).await.is_ok(),
        None => false,
    }
}

async fn can_connect(port: Option<u16>) -> bool {
    let Some(port) = port else {
        return false;
    };
    matches!(
        tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

async fn is_process_running(name: &str) -> bool {
    Command::new("pgrep")
        .arg("-x")
        .arg(name)
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[async_trait]
impl HealthProbe for SystemProbe {
    async fn check(&self) -> HealthReport {
        let config = self.config.snapshot();

        let mut processes = BTreeMap::new();
        for name in &config.watched_processes {
            processes.insert(name.clone(), is_process_running(name).await);
        }

        HealthReport {
            private_api_connected: can_connect(config.private_api_port).await,
            disk_access: can_read(config.messages_db_path.clone()).await,
            accounts: config.accounts.clone(),
            processes,
        }
    }
}

#[derive(Debug, Clone)]
struct Ticker {
    config: Arc<ConfigStore>,
    vault: Vault,
    dispatcher: WebhookDispatcher,
    probe: Arc<dyn HealthProbe>,
}

impl Ticker {
    async fn tick(&self, started: Instant) -> Option<usize> {
        if !self.config.onboarding_complete() {
            log::debug!("[Heartbeat] Onboarding incomplete, skipping");
            return None;
        }

        let report = self.probe.check().await;
        let snapshot = HeartbeatSnapshot::new(
            report,
            started.elapsed().as_secs(),
            self.vault.get_device_id(),
        );
        let data = match serde_json::to_value(&snapshot) {
            Ok(data) => data,
            Err(e) => {
                log::error!("[Heartbeat] Could not serialize snapshot: {e}");
                return None;
            }
        };

        let sent = self.dispatcher.dispatch(WebhookEvent::new(HEARTBEAT_EVENT, data));
        log::debug!("[Heartbeat] Sent to {sent} subscriber(s)");
        Some(sent)
    }
}

/// Schedules heartbeats. At most one timer runs per monitor.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ticker: Ticker,
    started: Mutex<Option<Instant>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    pub fn new(ctx: &AppContext, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            ticker: Ticker {
                config: Arc::clone(&ctx.config),
                vault: ctx.vault.clone(),
                dispatcher: ctx.dispatcher.clone(),
                probe,
            },
            started: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the timer. Logs a warning and does nothing if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            log::warn!("[Heartbeat] Monitor already running");
            return;
        }

        let started = Instant::now();
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = Some(started);

        let config = self.ticker.config.snapshot();
        let initial_delay = config.heartbeat_initial_delay();
        let interval = config.heartbeat_interval();
        let ticker = self.ticker.clone();

        log::info!(
            "[Heartbeat] Starting: first in {}s, then every {}s",
            initial_delay.as_secs(),
            interval.as_secs()
        );

        *handle = Some(tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut timer = tokio::time::interval(interval);
            loop {
                // First tick completes immediately.
                timer.tick().await;
                ticker.tick(started).await;
            }
        }));
    }

    /// Stop the timer. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            log::info!("[Heartbeat] Stopped");
        }
    }

    /// Whether the timer task is alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Send one heartbeat now. Returns the number of deliveries started, or
    /// `None` if skipped because onboarding is incomplete.
    pub async fn tick(&self) -> Option<usize> {
        let started = *self.started.lock().unwrap_or_else(|e| e.into_inner());
        self.ticker.tick(started.unwrap_or_else(Instant::now)).await
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
