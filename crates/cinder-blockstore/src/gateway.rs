//! Physical store backends.
//!
//! The loader needs only `get`, `put`, `delete` and `list` by key. Backends
//! are chosen by URL scheme through a [`GatewayRegistry`], which also caches
//! one instance per base URL so that every ledger naming the same backend
//! shares it.

use async_trait::async_trait;
use bytes::Bytes;
use cinder_keybag::{KeyBagError, KeyBagProvider, StoredKeySet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::GatewayError;
use crate::url::{StoreKind, StoreUrl};

/// Byte-addressable get/put/delete-by-key contract.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Fetch the bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Bytes, GatewayError>;

    /// Store `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GatewayError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;

    /// Keys starting with `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, GatewayError>;
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryGateway {
    items: RwLock<BTreeMap<String, Bytes>>,
    fail_writes: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail, simulating an unavailable store.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn get(&self, key: &str) -> Result<Bytes, GatewayError> {
        self.items
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GatewayError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Io {
                key: key.to_string(),
                message: "store unavailable".to_string(),
            });
        }
        self.items.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        self.items.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .items
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Backend writing one file per key below a root directory.
pub struct FileGateway {
    root: PathBuf,
}

impl FileGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileGateway { root: root.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn io_error(key: &str, e: std::io::Error) -> GatewayError {
    if e.kind() == std::io::ErrorKind::NotFound {
        GatewayError::NotFound(key.to_string())
    } else {
        GatewayError::Io {
            key: key.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Gateway for FileGateway {
    async fn get(&self, key: &str) -> Result<Bytes, GatewayError> {
        tokio::fs::read(self.path(key))
            .await
            .map(Bytes::from)
            .map_err(|e| io_error(key, e))
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), GatewayError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }
        // write then rename so readers never observe a partial file
        let tmp = path.with_extension(format!("tmp-{}", ulid::Ulid::new()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_error(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) && !key.contains(".tmp-") {
                        out.push(key);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Builds a backend for a URL.
pub type GatewayFactory =
    Arc<dyn Fn(&StoreUrl) -> Result<Arc<dyn Gateway>, GatewayError> + Send + Sync>;

fn memory_factory(_: &StoreUrl) -> Result<Arc<dyn Gateway>, GatewayError> {
    Ok(Arc::new(MemoryGateway::new()))
}

fn file_factory(url: &StoreUrl) -> Result<Arc<dyn Gateway>, GatewayError> {
    Ok(Arc::new(FileGateway::new(url.path())))
}

/// Resolves backends by URL scheme and owns the per-base-URL instances.
pub struct GatewayRegistry {
    factories: RwLock<HashMap<String, GatewayFactory>>,
    instances: RwLock<HashMap<String, Arc<dyn Gateway>>>,
}

impl GatewayRegistry {
    /// A registry without any scheme.
    pub fn empty() -> Self {
        GatewayRegistry {
            factories: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// A registry knowing `memory://` and `file://`.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register("memory", Arc::new(memory_factory));
        registry.register("file", Arc::new(file_factory));
        registry
    }

    pub fn register(&self, scheme: &str, factory: GatewayFactory) {
        self.factories.write().insert(scheme.to_string(), factory);
    }

    /// Put a prebuilt backend in place for `base_url`.
    pub fn insert(&self, base_url: &str, gateway: Arc<dyn Gateway>) -> Result<(), GatewayError> {
        let base = StoreUrl::parse(base_url)?.base();
        self.instances.write().insert(base, gateway);
        Ok(())
    }

    /// The backend for `url`, creating it on first use.
    pub fn resolve(&self, url: &StoreUrl) -> Result<Arc<dyn Gateway>, GatewayError> {
        let base = url.base();
        if let Some(gw) = self.instances.read().get(&base) {
            return Ok(gw.clone());
        }
        let factory = self
            .factories
            .read()
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| GatewayError::UnknownScheme(url.scheme().to_string()))?;

        let mut instances = self.instances.write();
        if let Some(gw) = instances.get(&base) {
            return Ok(gw.clone());
        }
        let gw = factory(url)?;
        debug!(base = %base, "created gateway");
        instances.insert(base, gw.clone());
        Ok(gw)
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A backend bound to one ledger's stores.
#[derive(Clone)]
pub struct AttachedStore {
    url: StoreUrl,
    gateway: Arc<dyn Gateway>,
}

impl AttachedStore {
    pub fn new(url: StoreUrl, gateway: Arc<dyn Gateway>) -> Self {
        AttachedStore { url, gateway }
    }

    /// Resolve the backend for `url` through `registry`.
    pub fn resolve(url: StoreUrl, registry: &GatewayRegistry) -> Result<Self, GatewayError> {
        let gateway = registry.resolve(&url)?;
        Ok(AttachedStore { url, gateway })
    }

    pub fn url(&self) -> &StoreUrl {
        &self.url
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn key(&self, kind: StoreKind, id: &str) -> String {
        self.url.for_store(kind).key(id)
    }

    pub async fn get(&self, kind: StoreKind, id: &str) -> Result<Bytes, GatewayError> {
        self.gateway.get(&self.key(kind, id)).await
    }

    pub async fn put(&self, kind: StoreKind, id: &str, bytes: Bytes) -> Result<(), GatewayError> {
        self.gateway.put(&self.key(kind, id), bytes).await
    }

    pub async fn delete(&self, kind: StoreKind, id: &str) -> Result<(), GatewayError> {
        self.gateway.delete(&self.key(kind, id)).await
    }
}

impl std::fmt::Debug for AttachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedStore").field("url", &self.url.base()).finish()
    }
}

/// Persists key sets in the `keybag` store of a backend.
pub struct GatewayKeyBagProvider {
    url: StoreUrl,
    gateway: Arc<dyn Gateway>,
}

impl GatewayKeyBagProvider {
    pub fn new(url: &StoreUrl, gateway: Arc<dyn Gateway>) -> Self {
        GatewayKeyBagProvider {
            url: url.for_store(StoreKind::KeyBag),
            gateway,
        }
    }

    fn key(&self, name: &str) -> String {
        // key set names carry characters that are awkward in paths
        let id: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.url.key(&id)
    }
}

#[async_trait]
impl KeyBagProvider for GatewayKeyBagProvider {
    async fn get(&self, name: &str) -> cinder_keybag::Result<Option<StoredKeySet>> {
        match self.gateway.get(&self.key(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(KeyBagError::Storage(e.to_string())),
        }
    }

    async fn set(&self, item: &StoredKeySet) -> cinder_keybag::Result<()> {
        let bytes = serde_json::to_vec(item)?;
        self.gateway
            .put(&self.key(&item.name), Bytes::from(bytes))
            .await
            .map_err(|e| KeyBagError::Storage(e.to_string()))
    }
}
