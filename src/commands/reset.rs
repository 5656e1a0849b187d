//! Reset command - removes tether credentials and local state.
//!
//! - Server credentials (password, webhook secret) from the secret store
//! - Device identity, unless `--keep-identity`
//! - `config.json` and `webhooks.json`
//!
//! The control plane is not contacted; the relay record is removed there
//! separately.

use anyhow::Result;
use std::io::{self, Write};
use std::path::Path;

use crate::config::Config;
use crate::context::AppContext;

const STATE_FILES: &[&str] = &["config.json", "webhooks.json"];

/// Run the reset command.
///
/// Shows what will be deleted and asks for confirmation unless `skip_confirm`.
pub fn run(skip_confirm: bool, keep_identity: bool) -> Result<()> {
    let config_dir = Config::config_dir()?;

    println!();
    println!("This will remove tether data from your system:");
    println!();
    println!("  Secret store:");
    println!("    - Server password and webhook secret");
    if keep_identity {
        println!("    (device identity is kept)");
    } else {
        println!("    - Device identity (a new one is created on next provisioning)");
    }
    println!();
    println!("  Config directory: {}", config_dir.display());
    for name in STATE_FILES {
        if config_dir.join(name).exists() {
            println!("    - {name}");
        }
    }
    println!();

    if !skip_confirm {
        print!("Are you sure? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    println!();
    println!("Removing data...");

    let (ctx, _rx) = AppContext::open(&config_dir)?;
    let cleared = if keep_identity {
        ctx.vault.clear_server_credentials()
    } else {
        ctx.vault.clear_all_credentials()
    };
    match cleared {
        Ok(()) => println!("  ✓ Cleared secret store"),
        Err(e) => println!("  ✗ Failed to clear secret store: {e}"),
    }

    remove_state_files(&config_dir);

    println!();
    println!("Reset complete. Run 'tether provision' to set up again.");
    log::info!("Reset complete (keep_identity={keep_identity})");
    Ok(())
}

fn remove_state_files(dir: &Path) {
    for name in STATE_FILES {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => println!("  ✓ Deleted {}", path.display()),
            Err(e) => println!("  ✗ Failed to delete {}: {e}", path.display()),
        }
    }
}
