//! Configuration types and loading.
//!
//! Config is loaded from a YAML file (e.g. `~/.sense/config.yaml`) and environment.
//!
//! ```yaml
//! api:
//!   url: https://api.sense.com/apiservice/api/v1/
//!   realtimeUrl: wss://clientrt.sense.com/
//! accounts:
//!   - credentials:
//!       email: me@example.com
//!       password: hunter2
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::client::{process_device_id, ClientOptions};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Endpoint overrides.
    #[serde(default)]
    pub api: ApiConfig,

    /// Accounts to log in to, in order.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// API endpoints and client identity. Everything is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// REST base URL (default https://api.sense.com/apiservice/api/v1/).
    pub url: Option<String>,
    /// Realtime feed base URL (default wss://clientrt.sense.com/).
    pub realtime_url: Option<String>,
    /// Origin header for the realtime handshake (default https://home.sense.com).
    pub origin: Option<String>,
    /// Client installation id. Defaults to a random id per process; "" disables it.
    pub device_id: Option<String>,
}

impl ApiConfig {
    /// Client options with every unset field at its default.
    pub fn client_options(&self) -> ClientOptions {
        let mut opts = ClientOptions::default();
        if let Some(url) = non_empty(&self.url) {
            opts.api_url = url;
        }
        if let Some(url) = non_empty(&self.realtime_url) {
            opts.realtime_url = url;
        }
        if let Some(origin) = non_empty(&self.origin) {
            opts.origin = origin;
        }
        opts.device_id = match &self.device_id {
            Some(id) => id.trim().to_string(),
            None => process_device_id().to_string(),
        };
        opts
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// Email and password for one account.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialsConfig {
    /// Read SENSE_EMAIL and SENSE_PASSWORD.
    pub fn from_env() -> Self {
        Self {
            email: env_non_empty("SENSE_EMAIL"),
            password: env_non_empty("SENSE_PASSWORD"),
        }
    }

    /// Fields of `self` win; missing ones are taken from `fallback`.
    pub fn blend(self, fallback: &CredentialsConfig) -> Self {
        Self {
            email: non_empty(&self.email).or_else(|| non_empty(&fallback.email)),
            password: non_empty(&self.password).or_else(|| non_empty(&fallback.password)),
        }
    }

    pub fn is_empty(&self) -> bool {
        non_empty(&self.email).is_none() && non_empty(&self.password).is_none()
    }

    /// Library credentials; email is required, password may be empty.
    pub fn to_credentials(&self) -> Option<crate::auth::PasswordCredentials> {
        let email = non_empty(&self.email)?;
        let password = non_empty(&self.password).unwrap_or_default();
        Some(crate::auth::PasswordCredentials::new(email, password))
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_non_empty(name: &str) -> Option<String> {
    non_empty(&std::env::var(name).ok())
}

/// Resolve the credentials to use, in order: `overrides` (e.g. CLI flags), then env
/// SENSE_EMAIL / SENSE_PASSWORD, then configured accounts.
///
/// Overrides and env form a single account that replaces the configured ones when it has
/// an email; otherwise they only fill gaps in the first configured account.
pub fn resolve_credentials(config: &Config, overrides: CredentialsConfig) -> Vec<CredentialsConfig> {
    resolve_credentials_with(config, overrides, CredentialsConfig::from_env())
}

fn resolve_credentials_with(
    config: &Config,
    overrides: CredentialsConfig,
    env: CredentialsConfig,
) -> Vec<CredentialsConfig> {
    let explicit = overrides.blend(&env);
    if non_empty(&explicit.email).is_some() {
        return vec![explicit];
    }
    let mut accounts: Vec<CredentialsConfig> = config
        .accounts
        .iter()
        .map(|a| a.credentials.clone())
        .filter(|c| !c.is_empty())
        .collect();
    match accounts.first_mut() {
        Some(first) => *first = first.clone().blend(&explicit),
        None if !explicit.is_empty() => accounts.push(explicit),
        None => {}
    }
    accounts
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SENSE_CONFIG").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".sense").join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml"))
    })
}

/// Load config from the given path, or the default path (or SENSE_CONFIG). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Parse YAML config text. An empty document is the default config.
pub fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}
