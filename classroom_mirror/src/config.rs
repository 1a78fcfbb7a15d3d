//! TOML configuration.
//!
//! ```toml
//! [auth]
//! client_secret_path = "credentials.json"
//! token_path = "token.json"
//!
//! [download]
//! root = "/home/me/Downloads/classroom"
//! concurrency = 4
//!
//! [export]
//! document = "docx"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::ExportPolicy;
use crate::error::{MirrorError, Result};
use crate::rate_limiter::{RateLimiter, DEFAULT_BURST, DEFAULT_REQUESTS_PER_SECOND};
use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "classroom-mirror.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub download: DownloadConfig,
    pub rate_limit: RateLimitConfig,
    pub traversal: TraversalConfig,
    pub export: ExportPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub client_secret_path: PathBuf,
    pub token_path: PathBuf,
    pub service_account_path: Option<PathBuf>,
    /// User to impersonate with a service account.
    pub subject: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_secret_path: PathBuf::from("credentials.json"),
            token_path: PathBuf::from("token.json"),
            service_account_path: None,
            subject: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub root: PathBuf,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            root: dirs::download_dir().unwrap_or_else(|| PathBuf::from("Downloads")),
            concurrency: 4,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 1000,
            max_delay_ms: 32_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub max_depth: Option<usize>,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self { max_depth: Some(32) }
    }
}

impl Config {
    /// Parse and validate a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| MirrorError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| MirrorError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.concurrency == 0 {
            return Err(MirrorError::Config("download.concurrency must be at least 1".into()));
        }
        if self.download.max_attempts == 0 {
            return Err(MirrorError::Config("download.max_attempts must be at least 1".into()));
        }
        if self.rate_limit.requests_per_second <= 0.0 || self.rate_limit.burst < 1.0 {
            return Err(MirrorError::Config(
                "rate_limit needs requests_per_second > 0 and burst >= 1".into(),
            ));
        }
        self.export.validate()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.download.max_attempts,
            Duration::from_millis(self.download.base_delay_ms),
            Duration::from_millis(self.download.max_delay_ms),
        )
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.rate_limit.requests_per_second, self.rate_limit.burst)
    }
}
