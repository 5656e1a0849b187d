//! Tunnel installation seam.
//!
//! Installing the tunnel is a privileged, persistent OS operation that may
//! block on an elevation prompt. The provisioning flow only sees the
//! tri-state [`TunnelOutcome`]; how the service gets installed is up to the
//! [`TunnelInstaller`] implementation.

use async_trait::async_trait;
use tokio::process::Command;

/// Result of one installation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// Tunnel is running and reachable from the control plane.
    Installed,
    /// Installation failed.
    Failed(String),
    /// The user declined the elevation prompt.
    Cancelled,
}

/// Installs the background tunnel for a decrypted tunnel token.
#[async_trait]
pub trait TunnelInstaller: Send + Sync + std::fmt::Debug {
    /// Install (or reinstall) the tunnel service.
    async fn install(&self, tunnel_token: &str) -> TunnelOutcome;
}

/// Output fragments meaning the user dismissed the privilege prompt.
/// `-128` is the AppleScript "User canceled" error number.
const CANCEL_MARKERS: &[&str] = &["user canceled", "user cancelled", "(-128)", "cancelled by user"];

/// Runs an external installer command with the token appended.
#[derive(Debug, Clone)]
pub struct CommandTunnelInstaller {
    program: String,
    args: Vec<String>,
}

impl CommandTunnelInstaller {
    /// Build from a `[program, args...]` vector. Returns `None` if empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

/// Classify a failed installer run from its combined output.
pub fn classify_failure(output: &str) -> TunnelOutcome {
    let lower = output.to_lowercase();
    if CANCEL_MARKERS.iter().any(|m| lower.contains(m)) {
        TunnelOutcome::Cancelled
    } else {
        let reason = output.trim();
        TunnelOutcome::Failed(if reason.is_empty() {
            "installer exited with an error".to_string()
        } else {
            reason.to_string()
        })
    }
}

#[async_trait]
impl TunnelInstaller for CommandTunnelInstaller {
    async fn install(&self, tunnel_token: &str) -> TunnelOutcome {
        log::info!("[Tunnel] Running {} {}", self.program, self.args.join(" "));

        let output = match Command::new(&self.program)
            .args(&self.args)
            .arg(tunnel_token)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => return TunnelOutcome::Failed(format!("could not run {}: {e}", self.program)),
        };

        if output.status.success() {
            log::info!("[Tunnel] Installed");
            return TunnelOutcome::Installed;
        }

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        // Installers echo their arguments on failure; keep the token out of logs.
        .replace(tunnel_token, "<redacted>");

        let outcome = classify_failure(&combined);
        log::warn!("[Tunnel] Installer exited with {}: {:?}", output.status, outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_cancel() {
        assert_eq!(
            classify_failure("execution error: User canceled. (-128)"),
            TunnelOutcome::Cancelled
        );
        assert_eq!(classify_failure("Operation cancelled by user"), TunnelOutcome::Cancelled);
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("  service already installed \n"),
            TunnelOutcome::Failed("service already installed".into())
        );
        assert!(matches!(classify_failure(""), TunnelOutcome::Failed(_)));
    }

    #[test]
    fn test_from_command() {
        assert!(CommandTunnelInstaller::from_command(&[]).is_none());
        let installer =
            CommandTunnelInstaller::from_command(&["cloudflared".into(), "service".into()]).unwrap();
        assert_eq!(installer.program, "cloudflared");
        assert_eq!(installer.args, vec!["service".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_installer_success_and_failure() {
        let ok = CommandTunnelInstaller::from_command(&["true".into()]).unwrap();
        assert_eq!(ok.install("tok").await, TunnelOutcome::Installed);

        let fail = CommandTunnelInstaller::from_command(&["false".into()]).unwrap();
        assert!(matches!(fail.install("tok").await, TunnelOutcome::Failed(_)));

        let missing =
            CommandTunnelInstaller::from_command(&["/nonexistent/tether-installer".into()]).unwrap();
        assert!(matches!(missing.install("tok").await, TunnelOutcome::Failed(_)));
    }
}
