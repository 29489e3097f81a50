//! Session core configuration
//!
//! Defaults are production values. A TOML file can override them, and
//! the `GYMFLOW_API_URL` environment variable takes precedence over both
//! for the API base so deployments can point the client without shipping
//! a config file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Tunables for the session controller and its collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// REST API base, e.g. `https://gym.example.com/api`. No trailing slash.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Bound on remote token verification before the controller falls
    /// back to cached state instead of hanging consumers.
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,

    /// Entitlement staleness window: a cached status older than this is
    /// re-checked before being trusted.
    #[serde(default = "default_entitlement_max_age_secs")]
    pub entitlement_max_age_secs: u64,

    /// Delay before the one-shot re-verification scheduled for a
    /// degraded session.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Per-request timeout for the shared HTTP client.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "http://localhost:8081/api".into()
}

fn default_verify_timeout_secs() -> u64 {
    10
}

fn default_entitlement_max_age_secs() -> u64 {
    30 * 60
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            verify_timeout_secs: default_verify_timeout_secs(),
            entitlement_max_age_secs: default_entitlement_max_age_secs(),
            retry_delay_secs: default_retry_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file, apply the environment
    /// override, and validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: SessionConfig = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// `GYMFLOW_API_URL` overrides the configured base when set and
    /// non-empty.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("GYMFLOW_API_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.api_base_url = url.trim_end_matches('/').to_string();
            }
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "api_base_url must start with http:// or https://, got: {}",
                self.api_base_url
            )));
        }
        if self.verify_timeout_secs == 0 {
            return Err(common::Error::Config(
                "verify_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.entitlement_max_age_secs == 0 {
            return Err(common::Error::Config(
                "entitlement_max_age_secs must be greater than 0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn entitlement_max_age(&self) -> Duration {
        Duration::from_secs(self.entitlement_max_age_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
