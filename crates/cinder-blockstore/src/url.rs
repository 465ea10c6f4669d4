//! Store addressing.
//!
//! A store is named by a URI whose query carries the recognized parameters
//! (`name`, `store`, `storekey`, `suffix`, `version`). Keys handed to a
//! [`Gateway`](crate::Gateway) are derived from it as
//! `{name}/{store}/{id}{suffix}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use ::url::Url;

use crate::error::GatewayError;

/// Recognized query parameters.
pub mod param {
    pub const NAME: &str = "name";
    pub const STORE: &str = "store";
    pub const STORE_KEY: &str = "storekey";
    pub const SUFFIX: &str = "suffix";
    pub const VERSION: &str = "version";
}

/// On-disk format version written by this crate.
pub const FORMAT_VERSION: &str = "v1";

/// The `storekey` value that disables encryption.
pub const INSECURE: &str = "insecure";

/// Which logical store a URL addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Data,
    Meta,
    Wal,
    File,
    KeyBag,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Data => "data",
            StoreKind::Meta => "meta",
            StoreKind::Wal => "wal",
            StoreKind::File => "file",
            StoreKind::KeyBag => "keybag",
        }
    }

    pub fn default_suffix(&self) -> &'static str {
        match self {
            StoreKind::Data | StoreKind::File => ".car",
            StoreKind::Meta | StoreKind::Wal | StoreKind::KeyBag => ".json",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "data" => Some(StoreKind::Data),
            "meta" => Some(StoreKind::Meta),
            "wal" => Some(StoreKind::Wal),
            "file" => Some(StoreKind::File),
            "keybag" => Some(StoreKind::KeyBag),
            _ => None,
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed store URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUrl {
    url: Url,
}

impl StoreUrl {
    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        let url = Url::parse(s).map_err(|e| GatewayError::InvalidUrl(format!("{s}: {e}")))?;
        Ok(StoreUrl { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Scheme, host and path without parameters. Identifies the physical
    /// store instance.
    pub fn base(&self) -> String {
        let mut base = self.url.clone();
        base.set_query(None);
        base.set_fragment(None);
        base.to_string()
    }

    pub fn param(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// A copy with `key` set to `value`, replacing any previous value.
    pub fn with_param(&self, key: &str, value: &str) -> Self {
        let kept: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != key)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut url = self.url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (k, v) in &kept {
                pairs.append_pair(k, v);
            }
            pairs.append_pair(key, value);
        }
        StoreUrl { url }
    }

    pub fn name(&self) -> Option<String> {
        self.param(param::NAME)
    }

    pub fn store(&self) -> Option<StoreKind> {
        self.param(param::STORE).and_then(|s| StoreKind::parse(&s))
    }

    pub fn storekey(&self) -> Option<String> {
        self.param(param::STORE_KEY)
    }

    pub fn is_insecure(&self) -> bool {
        self.storekey().as_deref() == Some(INSECURE)
    }

    pub fn suffix(&self) -> String {
        self.param(param::SUFFIX)
            .or_else(|| self.store().map(|s| s.default_suffix().to_string()))
            .unwrap_or_default()
    }

    pub fn version(&self) -> Option<String> {
        self.param(param::VERSION)
    }

    /// The URL of a sibling logical store.
    pub fn for_store(&self, kind: StoreKind) -> Self {
        self.with_param(param::STORE, kind.as_str())
            .with_param(param::SUFFIX, kind.default_suffix())
    }

    /// Gateway key for object `id` in this store.
    pub fn key(&self, id: &str) -> String {
        let name = self.name().unwrap_or_default();
        let store = self.param(param::STORE).unwrap_or_default();
        format!("{}/{}/{}{}", name, store, id, self.suffix())
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}
