//! Serve command - run the relay until interrupted.

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::context::AppContext;
use crate::heartbeat::{HeartbeatMonitor, SystemProbe};
use crate::server;
use crate::signals;

/// Run the local API and heartbeat monitor until Ctrl-C.
pub async fn run() -> Result<()> {
    let config_dir = Config::config_dir()?;
    let (ctx, rx) = AppContext::open(&config_dir)?;
    tokio::spawn(signals::log_signals(rx));

    if !ctx.config.onboarding_complete() {
        log::warn!("Device is not provisioned; heartbeats are paused until 'tether provision' completes");
        eprintln!("Warning: this device is not provisioned yet. Run 'tether provision'.");
    }

    let listener = server::bind(&ctx).await?;
    println!("Local API listening on http://{}", listener.local_addr()?);

    let monitor = HeartbeatMonitor::new(&ctx, Arc::new(SystemProbe::new(Arc::clone(&ctx.config))));
    monitor.start();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        log::info!("Shutdown requested");
    };

    let result = server::serve(ctx, listener, shutdown).await;
    monitor.stop();
    result
}
