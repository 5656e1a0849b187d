//! Provision command - onboard this device with a provisioning token.
//!
//! Prompts for the token when none is passed and stdin is a terminal.
//! When tunnel installation is cancelled or fails, an interactive session
//! offers to retry; the token is not exchanged again.

use anyhow::{bail, Context, Result};
use std::io::{self, Write};
use std::sync::Arc;

use crate::config::Config;
use crate::context::AppContext;
use crate::error::ProvisionError;
use crate::provision::{CommandTunnelInstaller, ProvisionState, Provisioner};
use crate::signals::{SignalReceiver, UiSignal};

fn is_interactive() -> bool {
    atty::is(atty::Stream::Stdin) && atty::is(atty::Stream::Stdout)
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn confirm(message: &str) -> Result<bool> {
    let answer = prompt(message)?;
    Ok(answer.is_empty() || matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

async fn print_progress(mut rx: SignalReceiver) {
    while let Some(signal) = rx.recv().await {
        if let UiSignal::Provisioning(state) = signal {
            log::info!("[Provision] {state}");
            if !matches!(state, ProvisionState::Failed { .. }) {
                println!("  → {state}");
            }
        }
    }
}

/// Run the provision command.
pub async fn run(token: Option<String>) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None if is_interactive() => prompt("Provisioning token: ")?,
        None => bail!("No provisioning token given; pass --token"),
    };

    let config_dir = Config::config_dir()?;
    let (ctx, rx) = AppContext::open(&config_dir)?;
    tokio::spawn(print_progress(rx));

    let tunnel_command = ctx.config.snapshot().tunnel_command;
    let installer = CommandTunnelInstaller::from_command(&tunnel_command)
        .context("tunnel_command in config.json is empty")?;
    let provisioner = Provisioner::new(ctx.clone(), Arc::new(installer));

    println!();
    println!("Provisioning this device...");
    let mut session = provisioner.begin(&token)?;
    let mut result = provisioner.run(&mut session).await;

    loop {
        match result {
            Ok(()) => break,
            Err(ProvisionError::PrivilegeCancelled | ProvisionError::TunnelFailed(_))
                if is_interactive() =>
            {
                if let Some(message) = session.last_error() {
                    println!();
                    println!("  ✗ {message}");
                }
                if !confirm("Retry tunnel installation? [Y/n] ")? {
                    bail!("Provisioning stopped at {}", session.state());
                }
                result = provisioner.retry(&mut session).await;
            }
            Err(e) => return Err(e).context("Provisioning failed"),
        }
    }

    let config = ctx.config.snapshot();
    println!();
    println!("✓ Device provisioned");
    if let Some(address) = session.server_address() {
        println!("  Address: {address}");
    }
    if let Some(email) = &config.user_email {
        println!("  Account: {email}");
    }
    println!();
    println!("Run 'tether serve' to start the relay.");
    Ok(())
}
