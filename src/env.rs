//! Runtime environment detection.
//!
//! Single source of truth for the runtime environment based on the
//! `TETHER_ENV` environment variable.
//!
//! Set `TETHER_ENV` to one of:
//! - `test` - Test mode (file-backed secret store instead of keyring)
//! - `system_test` - End-to-end tests against a staging control plane (file store)
//! - `development` or `dev` - Development mode
//! - (anything else or unset) - Production mode

/// Application name used for config directories and the keyring service.
pub const APP_NAME: &str = "tether";

/// Runtime environment for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - uses file storage for secrets.
    Test,
    /// System test environment - real control plane, file storage for secrets.
    SystemTest,
}

impl Environment {
    /// Detect current environment from `TETHER_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var("TETHER_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("system_test") => Self::SystemTest,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if running in any test mode (test or system_test).
    /// Use this to skip the OS keyring and use file storage instead.
    #[must_use]
    pub fn is_any_test(self) -> bool {
        matches!(self, Self::Test | Self::SystemTest)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
            Self::SystemTest => write!(f, "system_test"),
        }
    }
}

/// Returns `true` if keyring should be bypassed (any test mode).
#[must_use]
pub fn should_skip_keyring() -> bool {
    Environment::current().is_any_test()
}
