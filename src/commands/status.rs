//! Status command - show what this device knows about itself.
//!
//! Never prints secrets, only whether they are present.

use anyhow::Result;

use crate::config::Config;
use crate::context::AppContext;
use crate::identity;

fn present(value: bool) -> &'static str {
    if value {
        "present"
    } else {
        "missing"
    }
}

/// Run the status command.
pub fn run() -> Result<()> {
    let config_dir = Config::config_dir()?;
    let (ctx, _rx) = AppContext::open(&config_dir)?;
    let config = ctx.config.snapshot();

    println!();
    println!("Config directory: {}", config_dir.display());
    println!("Control plane:    {}", config.control_plane_url);
    println!("Local API:        http://{}:{}", config.api_host, config.api_port);
    println!();

    println!("Identity:");
    match (ctx.vault.get_device_id(), ctx.vault.get_public_key()) {
        (Some(id), Some(key)) => {
            println!("  Device id:   {id}");
            println!("  Fingerprint: {}", identity::fingerprint(&key));
        }
        _ => println!("  (none yet - created on first provisioning)"),
    }
    println!();

    println!("Provisioning:");
    println!(
        "  Onboarding:  {}",
        if config.onboarding_complete { "complete" } else { "incomplete" }
    );
    if let Some(id) = &config.linkage.server_id {
        println!("  Server id:   {id}");
    }
    if let Some(address) = &config.linkage.server_address {
        println!("  Address:     {address}");
    }
    if let Some(email) = &config.user_email {
        println!("  Account:     {email}");
    }
    match ctx.vault.credentials() {
        Ok(creds) => {
            println!("  Password:    {}", present(creds.server_password.is_some()));
            println!("  Webhook key: {}", present(creds.webhook_secret.is_some()));
        }
        Err(e) => println!("  Credentials: unavailable ({e})"),
    }
    println!();

    let hooks = ctx.webhooks.list();
    println!("Webhooks: {}", hooks.len());
    for hook in hooks {
        println!("  #{} {} [{}]", hook.id, hook.url, hook.events.join(", "));
    }
    println!();

    Ok(())
}
