//! Runtime configuration.
//!
//! [`RuntimeConfig`] gathers every tunable the engine reads: registry
//! endpoints, the image cache location, timeouts, retry policy and the run
//! mode. Defaults come from [`crate::constants`]; the CLI maps flags and
//! `MAGIKJAIL_*` environment variables onto it.

use crate::constants::{
    DEFAULT_AUTH_SERVICE, DEFAULT_AUTH_URL, DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_MAX_RETRIES,
    DEFAULT_NAMESPACE, DEFAULT_REGISTRY_URL, DEFAULT_RETRY_BACKOFF, IMAGE_PULL_TIMEOUT,
    IMAGES_DIR, REQUEST_TIMEOUT, STATE_DIR_NAME,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the execution root is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Pull the image (unless cached) and run inside its flattened rootfs.
    #[default]
    Image,
    /// Copy the target executable into an empty temp root; no pull.
    Sandbox,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Sandbox => write!(f, "sandbox"),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Token service URL.
    pub auth_url: String,
    /// `service` query parameter for the token service.
    pub auth_service: String,
    /// Registry base URL.
    pub registry_url: String,
    /// Namespace prepended to single-component image names.
    pub namespace: String,
    /// Directory holding flattened image roots.
    pub images_root: PathBuf,
    /// Timeout for one registry request (and each blob chunk read).
    pub request_timeout: Duration,
    /// Timeout for an entire pull.
    pub pull_timeout: Duration,
    /// Layer blobs downloaded concurrently. Extraction stays sequential.
    pub download_concurrency: usize,
    /// Retries for 429/5xx registry responses.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_backoff: Duration,
    /// Run mode.
    pub mode: RunMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            auth_service: DEFAULT_AUTH_SERVICE.to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            images_root: Self::default_images_root(),
            request_timeout: REQUEST_TIMEOUT,
            pull_timeout: IMAGE_PULL_TIMEOUT,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            mode: RunMode::default(),
        }
    }
}

impl RuntimeConfig {
    /// Returns the default images root (`~/.magikjail/images`).
    pub fn default_images_root() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(STATE_DIR_NAME).join(IMAGES_DIR)
        } else {
            PathBuf::from(STATE_DIR_NAME).join(IMAGES_DIR)
        }
    }

    /// Points both the token service and the registry at one base URL.
    ///
    /// The token endpoint becomes `<base>/token`. Mostly useful for local
    /// registries and tests.
    pub fn with_registry_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.auth_url = format!("{}/token", base);
        self.registry_url = base.to_string();
        self
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [("auth_url", &self.auth_url), ("registry_url", &self.registry_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, url
                )));
            }
        }
        if self.namespace.contains("..") {
            return Err(Error::Config(format!(
                "namespace '{}' must not contain '..'",
                self.namespace
            )));
        }
        if self.download_concurrency == 0 {
            return Err(Error::Config(
                "download_concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() || self.pull_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}
