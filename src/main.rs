//! Tether CLI - local relay agent.
//!
//! This is the main binary entry point. See the `tether` library for the
//! core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tether::{commands, Config};

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Secure device provisioning and authenticated webhook relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Onboard this device with a provisioning token
    Provision {
        /// Single-use provisioning token (prompted for when omitted)
        #[arg(long)]
        token: Option<String>,
    },
    /// Run the local API and heartbeat monitor
    Serve,
    /// Show identity, linkage and webhook registrations
    Status,
    /// Remove credentials and local state
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
        /// Keep the device identity
        #[arg(long)]
        keep_identity: bool,
    },
}

fn init_logging() -> Result<()> {
    // TETHER_LOG_FILE, else {config_dir}/tether.log
    let log_path = match std::env::var("TETHER_LOG_FILE") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => Config::config_dir()?.join("tether.log"),
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file at {}", log_path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        default_hook(panic_info);
    }));

    let cli = Cli::parse();
    log::info!("tether {} ({})", env!("CARGO_PKG_VERSION"), tether::env::Environment::current());

    match cli.command {
        Commands::Provision { token } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::provision::run(token))?;
        }
        Commands::Serve => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::serve::run())?;
        }
        Commands::Status => commands::status::run()?,
        Commands::Reset { yes, keep_identity } => commands::reset::run(yes, keep_identity)?,
    }

    Ok(())
}
