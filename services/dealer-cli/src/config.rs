//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Tokens are never read from the TOML; `login` takes them from flags or
//! `DEALER_ACCESS_TOKEN` / `DEALER_REFRESH_TOKEN`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dealer_client::{ClientConfig, DEFAULT_REQUEST_ID_HEADER, RetryPolicy};
use serde::Deserialize;
use transport::HeaderName;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Dealer API endpoint settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

/// Transient retry policy
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,
    #[serde(default)]
    pub jitter: bool,
}

/// Credential persistence and refresh timing
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
    /// Background refresh interval; unset disables the task
    #[serde(default)]
    pub background_refresh_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retry_after_secs: default_max_retry_after_secs(),
            jitter: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            refresh_skew_secs: default_refresh_skew_secs(),
            background_refresh_secs: None,
        }
    }
}

fn default_refresh_path() -> String {
    dealer_auth::DEFAULT_REFRESH_PATH.to_owned()
}

fn default_timeout() -> u64 {
    30
}

fn default_request_id_header() -> String {
    DEFAULT_REQUEST_ID_HEADER.to_owned()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_max_retry_after_secs() -> u64 {
    60
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("dealer-credentials.json")
}

fn default_refresh_skew_secs() -> u64 {
    60
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(common::Error::Config(format!(
                "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        if self.auth.background_refresh_secs == Some(0) {
            return Err(common::Error::Config(
                "background_refresh_secs must be greater than 0 when set".into(),
            ));
        }

        self.request_id_header()?;
        Ok(())
    }

    fn request_id_header(&self) -> common::Result<HeaderName> {
        HeaderName::from_bytes(self.api.request_id_header.as_bytes()).map_err(|e| {
            common::Error::Config(format!(
                "request_id_header {:?} is not a valid header name: {e}",
                self.api.request_id_header
            ))
        })
    }

    /// Client settings derived from this file.
    pub fn client_config(&self) -> common::Result<ClientConfig> {
        let mut client = ClientConfig::new(self.api.base_url.clone());
        client.refresh_path = self.api.refresh_path.clone();
        client.timeout = Duration::from_secs(self.api.timeout_secs);
        client.refresh_skew = Duration::from_secs(self.auth.refresh_skew_secs);
        client.request_id_header = self.request_id_header()?;
        client.retry = RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_retry_after: Duration::from_secs(self.retry.max_retry_after_secs),
            jitter: self.retry.jitter,
        };
        Ok(client)
    }

    /// Resolve config file path from CLI arg or DEALER_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("DEALER_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("dealer-api.toml")
    }
}
