use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::daemon::auth::generate_token;
use crate::daemon::side_channel::DaemonSettings;
use crate::provisioner::ProvisionerConfig;

pub const DEFAULT_DAEMON_PORT: u16 = 8000;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `None` means "generate one at startup".
    pub token: Option<String>,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("DAEMON_PORT").ok().as_deref(),
            std::env::var("DAEMON_TOKEN").ok().as_deref(),
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        port: Option<&str>,
        token: Option<&str>,
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
    ) -> Self {
        let port = port
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_DAEMON_PORT);

        let token = token.map(str::trim).filter(|s| !s.is_empty()).map(String::from);

        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        Config {
            port,
            token,
            sentry_dsn,
            environment,
        }
    }

    /// The configured token, or a freshly generated one. The flag tells
    /// whether it was generated.
    pub fn resolve_token(&self) -> Result<(String, bool)> {
        match &self.token {
            Some(token) => Ok((token.clone(), false)),
            None => {
                let token = generate_token().context("failed to generate API token")?;
                Ok((token, true))
            }
        }
    }
}

fn load_yaml<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse {what} file: {}", path.display()))
}

pub fn load_provisioner_config(path: &Path) -> Result<ProvisionerConfig> {
    load_yaml(path, "provisioner config")
}

pub fn load_daemon_settings(path: &Path) -> Result<DaemonSettings> {
    load_yaml(path, "daemon settings")
}
