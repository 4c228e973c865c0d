//! Vault options.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use akravault_common::{Error, Result};
use akravault_crypto::aead::MAX_CHUNK_SIZE;
use akravault_crypto::{KdfParams, DEFAULT_BLOCK_SIZE};
use akravault_storage::RetryConfig;

/// Default catalog file name, relative to the working directory.
pub const DEFAULT_CATALOG_PATH: &str = "./storage.bin";

/// Options for opening a vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultOptions {
    /// Where the catalog is stored.
    pub catalog_path: PathBuf,
    /// Maximum number of cipher tasks running at once.
    pub max_threads: usize,
    /// Plaintext bytes per chunk when encrypting.
    pub block_size: usize,
    /// Directory for working copies and temporary outputs.
    pub temp_dir: PathBuf,
    /// Keep caller-supplied extra properties on catalog records.
    pub allow_extra_props: bool,
    /// KDF parameters for a newly created catalog.
    pub kdf: KdfParams,
    /// How long an idle task pool lives before it is torn down.
    pub pool_idle_timeout: Duration,
    /// Retry policy for filesystem calls.
    pub retry: RetryConfig,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from(DEFAULT_CATALOG_PATH),
            max_threads: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            temp_dir: std::env::temp_dir(),
            allow_extra_props: false,
            kdf: KdfParams::default(),
            pool_idle_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl VaultOptions {
    /// Options storing the catalog at `catalog_path`, defaults elsewhere.
    pub fn new(catalog_path: impl Into<PathBuf>) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            ..Self::default()
        }
    }

    /// Set the maximum number of parallel cipher tasks.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the encryption block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the directory for temporary data.
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    /// Allow or drop extra properties on catalog records.
    pub fn with_extra_props(mut self, allow: bool) -> Self {
        self.allow_extra_props = allow;
        self
    }

    /// Set the KDF parameters used for a new catalog.
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Set the idle timeout of the task pool.
    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    /// Set the filesystem retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Check the options for values the vault cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(Error::InvalidInput("max_threads must be at least 1".to_string()));
        }
        if self.block_size == 0 || self.block_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "block_size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.block_size
            )));
        }
        if self.catalog_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("catalog_path cannot be empty".to_string()));
        }
        if self.pool_idle_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "pool_idle_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize options to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}
