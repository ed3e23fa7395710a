//! Drive client configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Client id of the application credentials shipped with drivestash.
pub const DEFAULT_CLIENT_ID: &str = "drivestash-backup.apps.googleusercontent.com";

/// Backoff parameters for retried API calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in seconds.
    pub initial_seconds: u64,
    /// Factor the delay grows by after every retry.
    pub multiplier: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

impl BackoffConfig {
    /// Delay before the first retry.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_seconds)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_seconds: 2,
            multiplier: 2,
            max_retries: 5,
        }
    }
}

/// Configuration for the drive client.
///
/// Every field has a default so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Base URL of the object API, without a trailing slash.
    pub drive_url: String,
    /// Provider token endpoint used when a client secret is known.
    pub token_url: String,
    /// Provider authorization endpoint for the out-of-band flow.
    pub authorize_url: String,
    /// Proxy refresh service used when no client secret is known.
    pub refresh_url: String,
    /// The well-known client id of the shipped application credentials.
    pub default_client_id: String,
    /// Where the credentials record is persisted.
    pub credentials_path: PathBuf,
    /// Socket connect and read timeout, in seconds.
    pub timeout_seconds: u64,
    /// Records requested per listing page.
    pub page_size: u32,
    /// Sent on every call in the `Client-Identifier` header.
    pub client_identifier: String,
    /// Retry policy for API calls.
    pub backoff: BackoffConfig,
    /// How many times a cached upload session may be resumed.
    pub resume_attempts: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            drive_url: "https://www.googleapis.com".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            refresh_url: "https://auth.drivestash.dev/drive/refresh".to_string(),
            default_client_id: DEFAULT_CLIENT_ID.to_string(),
            credentials_path: default_credentials_path(),
            timeout_seconds: 180,
            page_size: 100,
            client_identifier: "drivestash".to_string(),
            backoff: BackoffConfig::default(),
            resume_attempts: 10,
        }
    }
}

impl DriveConfig {
    /// Set the object API base URL.
    pub fn with_drive_url(mut self, url: impl Into<String>) -> Self {
        self.drive_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the provider token endpoint.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Set the proxy refresh endpoint.
    pub fn with_refresh_url(mut self, url: impl Into<String>) -> Self {
        self.refresh_url = url.into();
        self
    }

    /// Set the credentials record location.
    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = path.into();
        self
    }

    /// Set the retry policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the listing page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Socket timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    fn validate(&self) -> Result<()> {
        if self.drive_url.is_empty() {
            return Err(Error::InvalidInput("drive_url cannot be empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("page_size must be positive".to_string()));
        }
        if self.backoff.multiplier == 0 {
            return Err(Error::InvalidInput(
                "backoff multiplier must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_credentials_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("drivestash").join("credentials.json"))
        .unwrap_or_else(|| PathBuf::from("credentials.json"))
}
