//! Ledger storage configuration.
//!
//! Callers describe only what they care about in a [`PartialLedgerConfig`];
//! [`LedgerConfig::from_partial`] fills in every remaining field without
//! touching shared state.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::url::{param, StoreKind, StoreUrl, FORMAT_VERSION, INSECURE};

pub const DEFAULT_STORE_URL: &str = "memory://cinder";
pub const DEFAULT_AUTO_COMPACT: usize = 100;
pub const DEFAULT_CAR_THRESHOLD: usize = 1_000_000;
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 256 * 1024;

/// Which key protects a ledger's blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKey {
    /// Plaintext storage. Must be chosen explicitly.
    Insecure,
    /// Blocks are sealed with the default key of this key bag entry.
    Named(String),
}

impl StoreKey {
    pub fn default_for(name: &str) -> Self {
        StoreKey::Named(format!("@{}-data@", name))
    }

    pub fn as_param(&self) -> &str {
        match self {
            StoreKey::Insecure => INSECURE,
            StoreKey::Named(n) => n,
        }
    }
}

/// Fully populated configuration for one ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Ledger name.
    pub name: String,
    /// Base URI of the local store.
    pub store_url: String,
    /// Encryption key reference.
    pub storekey: StoreKey,
    /// Compact once the car log grows past this many groups.
    pub auto_compact: usize,
    /// Maximum archive size in bytes before a commit is split.
    pub car_threshold: usize,
    /// Chunk size for file payloads.
    pub file_chunk_size: usize,
    /// Base URIs of replicas that receive every archive and meta.
    pub remotes: Vec<String>,
}

/// Caller-supplied configuration; unset fields take defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialLedgerConfig {
    pub name: Option<String>,
    pub store_url: Option<String>,
    pub storekey: Option<StoreKey>,
    pub auto_compact: Option<usize>,
    pub car_threshold: Option<usize>,
    pub file_chunk_size: Option<usize>,
    pub remotes: Option<Vec<String>>,
}

impl LedgerConfig {
    /// Populate every field of a partial configuration.
    pub fn from_partial(partial: PartialLedgerConfig) -> Self {
        let name = partial.name.unwrap_or_else(|| "default".to_string());
        let storekey = partial
            .storekey
            .unwrap_or_else(|| StoreKey::default_for(&name));
        LedgerConfig {
            store_url: partial
                .store_url
                .unwrap_or_else(|| DEFAULT_STORE_URL.to_string()),
            storekey,
            auto_compact: partial.auto_compact.unwrap_or(DEFAULT_AUTO_COMPACT),
            car_threshold: partial.car_threshold.unwrap_or(DEFAULT_CAR_THRESHOLD),
            file_chunk_size: partial
                .file_chunk_size
                .unwrap_or(DEFAULT_FILE_CHUNK_SIZE),
            remotes: partial.remotes.unwrap_or_default(),
            name,
        }
    }

    fn with_params(&self, base: &str, kind: StoreKind) -> Result<StoreUrl> {
        let url = StoreUrl::parse(base)
            .map_err(|e| StoreError::Config(e.to_string()))?
            .with_param(param::NAME, &self.name)
            .with_param(param::STORE_KEY, self.storekey.as_param())
            .with_param(param::VERSION, FORMAT_VERSION);
        Ok(url.for_store(kind))
    }

    /// URL of one logical store on the local backend.
    pub fn local_url(&self, kind: StoreKind) -> Result<StoreUrl> {
        self.with_params(&self.store_url, kind)
    }

    /// URLs of one logical store on every remote.
    pub fn remote_urls(&self, kind: StoreKind) -> Result<Vec<StoreUrl>> {
        self.remotes
            .iter()
            .map(|r| self.with_params(r, kind))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StoreError::Config("ledger name must not be empty".into()));
        }
        if self.car_threshold == 0 || self.file_chunk_size == 0 {
            return Err(StoreError::Config(
                "car_threshold and file_chunk_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::from_partial(PartialLedgerConfig::default())
    }
}

/// Builder for ledger configuration.
pub struct LedgerConfigBuilder {
    partial: PartialLedgerConfig,
}

impl LedgerConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            partial: PartialLedgerConfig {
                name: Some(name.into()),
                ..Default::default()
            },
        }
    }

    pub fn store_url(mut self, url: impl Into<String>) -> Self {
        self.partial.store_url = Some(url.into());
        self
    }

    pub fn storekey(mut self, key: StoreKey) -> Self {
        self.partial.storekey = Some(key);
        self
    }

    pub fn insecure(self) -> Self {
        self.storekey(StoreKey::Insecure)
    }

    pub fn auto_compact(mut self, threshold: usize) -> Self {
        self.partial.auto_compact = Some(threshold);
        self
    }

    pub fn car_threshold(mut self, bytes: usize) -> Self {
        self.partial.car_threshold = Some(bytes);
        self
    }

    pub fn file_chunk_size(mut self, bytes: usize) -> Self {
        self.partial.file_chunk_size = Some(bytes);
        self
    }

    pub fn remote(mut self, url: impl Into<String>) -> Self {
        self.partial
            .remotes
            .get_or_insert_with(Vec::new)
            .push(url.into());
        self
    }

    pub fn build(self) -> LedgerConfig {
        LedgerConfig::from_partial(self.partial)
    }
}
