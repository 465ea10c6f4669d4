//! Named, fingerprint-indexed key sets.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{KeyBagError, Result};
use crate::fingerprint::KeyMaterial;

/// Persisted form of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    #[serde(rename = "fingerPrint")]
    pub fingerprint: String,
    pub key: String,
    #[serde(default)]
    pub default: bool,
}

/// Persisted form of a named key set: `{ name, keys: { fpr: StoredKey } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeySet {
    pub name: String,
    #[serde(default)]
    pub keys: BTreeMap<String, StoredKey>,
}

/// Storage backend for key sets.
#[async_trait]
pub trait KeyBagProvider: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Option<StoredKeySet>>;
    async fn set(&self, item: &StoredKeySet) -> Result<()>;
}

/// Keeps key sets in memory. Useful for tests.
#[derive(Default)]
pub struct MemoryKeyBagProvider {
    items: RwLock<HashMap<String, StoredKeySet>>,
    writes: RwLock<usize>,
}

impl MemoryKeyBagProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls observed.
    pub fn write_count(&self) -> usize {
        *self.writes.read()
    }
}

#[async_trait]
impl KeyBagProvider for MemoryKeyBagProvider {
    async fn get(&self, name: &str) -> Result<Option<StoredKeySet>> {
        Ok(self.items.read().get(name).cloned())
    }

    async fn set(&self, item: &StoredKeySet) -> Result<()> {
        self.items.write().insert(item.name.clone(), item.clone());
        *self.writes.write() += 1;
        Ok(())
    }
}

/// A key together with its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWithFingerprint {
    pub fingerprint: String,
    pub material: KeyMaterial,
    pub default: bool,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpsertResult {
    /// Whether the fingerprint was new or the default flag moved.
    pub modified: bool,
    pub fingerprint: String,
}

/// One named key set.
pub struct KeysByFingerprint {
    name: String,
    provider: Arc<dyn KeyBagProvider>,
    keys: RwLock<Vec<KeyWithFingerprint>>,
    upsert_lock: tokio::sync::Mutex<()>,
}

impl KeysByFingerprint {
    fn empty(name: &str, provider: Arc<dyn KeyBagProvider>) -> Self {
        KeysByFingerprint {
            name: name.to_string(),
            provider,
            keys: RwLock::new(Vec::new()),
            upsert_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn upsert_no_store(&self, material: KeyMaterial, default: bool) -> KeyUpsertResult {
        apply_upsert(&mut self.keys.write(), material, default)
    }

    /// Insert `material` if its fingerprint is new and optionally make it the
    /// default. The set is persisted only when something changed.
    pub async fn upsert(&self, material: KeyMaterial, default: bool) -> Result<KeyUpsertResult> {
        let _guard = self.upsert_lock.lock().await;
        let mut next = self.keys.read().clone();
        let result = apply_upsert(&mut next, material, default);
        if result.modified {
            // memory only follows a successful store write
            self.provider.set(&stored_form(&self.name, &next)).await?;
            *self.keys.write() = next;
            debug!(name = %self.name, fpr = %result.fingerprint, default, "key set modified");
        }
        Ok(result)
    }

    /// Upsert from a base58 key string, as received from a peer.
    pub async fn upsert_str(&self, key: &str, default: bool) -> Result<KeyUpsertResult> {
        let material = KeyMaterial::from_key_str(key)?;
        self.upsert(material, default).await
    }

    /// Look a key up by fingerprint; `None` or `"*"` returns the default.
    pub fn get(&self, fingerprint: Option<&str>) -> Option<KeyWithFingerprint> {
        let keys = self.keys.read();
        match fingerprint {
            None | Some("*") => keys.iter().find(|k| k.default).cloned(),
            Some(fpr) => keys.iter().find(|k| k.fingerprint == fpr).cloned(),
        }
    }

    /// The current default key.
    pub fn default_key(&self) -> Result<KeyWithFingerprint> {
        self.get(None).ok_or_else(|| KeyBagError::MissingKey {
            name: self.name.clone(),
            fingerprint: "*".to_string(),
        })
    }

    /// Base58 strings of every key in the set, default first.
    pub fn key_strings(&self) -> Vec<String> {
        let keys = self.keys.read();
        let mut out: Vec<String> = keys
            .iter()
            .filter(|k| k.default)
            .map(|k| k.material.to_key_str())
            .collect();
        out.extend(
            keys.iter()
                .filter(|k| !k.default)
                .map(|k| k.material.to_key_str()),
        );
        out
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.keys.read().iter().map(|k| k.fingerprint.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn to_stored(&self) -> StoredKeySet {
        stored_form(&self.name, &self.keys.read())
    }

    fn load(&self, stored: &StoredKeySet) -> Result<()> {
        // defaults are applied last so that a stored default wins
        let mut entries: Vec<&StoredKey> = stored.keys.values().collect();
        entries.sort_by_key(|k| k.default);
        for item in entries {
            let material = KeyMaterial::from_key_str(&item.key)?;
            let computed = material.fingerprint();
            if computed != item.fingerprint {
                return Err(KeyBagError::FingerprintMismatch {
                    stored: item.fingerprint.clone(),
                    computed,
                });
            }
            self.upsert_no_store(material, item.default);
        }
        Ok(())
    }
}

fn apply_upsert(
    keys: &mut Vec<KeyWithFingerprint>,
    material: KeyMaterial,
    default: bool,
) -> KeyUpsertResult {
    let fingerprint = material.fingerprint();

    if let Some(pos) = keys.iter().position(|k| k.fingerprint == fingerprint) {
        if !default || keys[pos].default {
            return KeyUpsertResult {
                modified: false,
                fingerprint,
            };
        }
        for (i, k) in keys.iter_mut().enumerate() {
            k.default = i == pos;
        }
        return KeyUpsertResult {
            modified: true,
            fingerprint,
        };
    }

    // the first key of a set always becomes the default
    let make_default = default || keys.is_empty();
    if make_default {
        for k in keys.iter_mut() {
            k.default = false;
        }
    }
    keys.push(KeyWithFingerprint {
        fingerprint: fingerprint.clone(),
        material,
        default: make_default,
    });
    KeyUpsertResult {
        modified: true,
        fingerprint,
    }
}

fn stored_form(name: &str, keys: &[KeyWithFingerprint]) -> StoredKeySet {
    let keys = keys
        .iter()
        .map(|k| {
            (
                k.fingerprint.clone(),
                StoredKey {
                    fingerprint: k.fingerprint.clone(),
                    key: k.material.to_key_str(),
                    default: k.default,
                },
            )
        })
        .collect();
    StoredKeySet {
        name: name.to_string(),
        keys,
    }
}

impl std::fmt::Debug for KeysByFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysByFingerprint")
            .field("name", &self.name)
            .field("fingerprints", &self.fingerprints())
            .finish()
    }
}

/// Resolves named key sets, loading each from the provider once.
pub struct KeyBag {
    provider: Arc<dyn KeyBagProvider>,
    named: tokio::sync::Mutex<HashMap<String, Arc<KeysByFingerprint>>>,
}

impl KeyBag {
    pub fn new(provider: Arc<dyn KeyBagProvider>) -> Self {
        KeyBag {
            provider,
            named: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// A key bag backed by memory only.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryKeyBagProvider::new()))
    }

    /// Resolve the key set called `name`.
    ///
    /// An unknown name fails with [`KeyBagError::NotFound`] when
    /// `fail_if_not_found` is set; otherwise the set is created with
    /// `material` (or fresh random material) as its default key. Material
    /// passed for an existing set is added as a non-default key.
    pub async fn get_named_key(
        &self,
        name: &str,
        fail_if_not_found: bool,
        material: Option<KeyMaterial>,
    ) -> Result<Arc<KeysByFingerprint>> {
        let mut named = self.named.lock().await;
        if let Some(set) = named.get(name) {
            if let Some(material) = material {
                set.upsert(material, false).await?;
            }
            return Ok(set.clone());
        }

        let set = Arc::new(KeysByFingerprint::empty(name, self.provider.clone()));
        match self.provider.get(name).await? {
            Some(stored) => set.load(&stored)?,
            None if fail_if_not_found => return Err(KeyBagError::NotFound(name.to_string())),
            None => {}
        }

        if set.is_empty() {
            let material = material.unwrap_or_else(KeyMaterial::generate);
            set.upsert(material, true).await?;
            info!(name, "created key set");
        } else if let Some(material) = material {
            set.upsert(material, false).await?;
        }

        named.insert(name.to_string(), set.clone());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Arc<MemoryKeyBagProvider> {
        Arc::new(MemoryKeyBagProvider::new())
    }

    #[tokio::test]
    async fn test_first_key_becomes_default() {
        let set = KeysByFingerprint::empty("n", provider());
        let k = KeyMaterial::generate();
        let r = set.upsert(k.clone(), false).await.unwrap();
        assert!(r.modified);
        assert_eq!(set.get(None).unwrap().material, k);
    }

    #[tokio::test]
    async fn test_repeated_upsert_is_noop() {
        let p = provider();
        let set = KeysByFingerprint::empty("n", p.clone());
        let k = KeyMaterial::generate();
        set.upsert(k.clone(), true).await.unwrap();
        let writes = p.write_count();

        let r = set.upsert(k.clone(), true).await.unwrap();
        assert!(!r.modified);
        let r = set.upsert(k, false).await.unwrap();
        assert!(!r.modified);
        assert_eq!(p.write_count(), writes);
    }

    #[tokio::test]
    async fn test_default_moves_exclusively() {
        let set = KeysByFingerprint::empty("n", provider());
        let a = KeyMaterial::generate();
        let b = KeyMaterial::generate();
        set.upsert(a.clone(), true).await.unwrap();
        set.upsert(b.clone(), false).await.unwrap();
        assert_eq!(set.get(Some("*")).unwrap().material, a);

        let r = set.upsert(b.clone(), true).await.unwrap();
        assert!(r.modified);
        assert_eq!(set.get(None).unwrap().material, b);
        let defaults = set.to_stored().keys.values().filter(|k| k.default).count();
        assert_eq!(defaults, 1);
    }

    /// Provider whose writes always fail.
    struct ReadOnlyProvider;

    #[async_trait]
    impl KeyBagProvider for ReadOnlyProvider {
        async fn get(&self, _name: &str) -> Result<Option<StoredKeySet>> {
            Ok(None)
        }

        async fn set(&self, _item: &StoredKeySet) -> Result<()> {
            Err(KeyBagError::Storage("read-only".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_store_write_leaves_set_unchanged() {
        let set = KeysByFingerprint::empty("n", Arc::new(ReadOnlyProvider));
        let a = KeyMaterial::generate();
        set.upsert_no_store(a.clone(), true);

        let b = KeyMaterial::generate();
        let err = set.upsert(b.clone(), true).await.unwrap_err();
        assert!(matches!(err, KeyBagError::Storage(_)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.default_key().unwrap().material, a);
        assert!(set.get(Some(&b.fingerprint())).is_none());
        assert!(set.to_stored().keys.get(&b.fingerprint()).is_none());
    }

    #[tokio::test]
    async fn test_lookup_by_fingerprint() {
        let set = KeysByFingerprint::empty("n", provider());
        let a = KeyMaterial::generate();
        set.upsert(a.clone(), true).await.unwrap();
        assert_eq!(set.get(Some(&a.fingerprint())).unwrap().material, a);
        assert!(set.get(Some("unknown")).is_none());
    }

    #[tokio::test]
    async fn test_named_key_created_and_reloaded() {
        let p = provider();
        let bag = KeyBag::new(p.clone());
        let set = bag.get_named_key("@ledger-data@", false, None).await.unwrap();
        assert_eq!(set.len(), 1);
        let fpr = set.default_key().unwrap().fingerprint;

        let reopened = KeyBag::new(p);
        let set = reopened.get_named_key("@ledger-data@", true, None).await.unwrap();
        assert_eq!(set.default_key().unwrap().fingerprint, fpr);
    }

    #[tokio::test]
    async fn test_fail_if_not_found() {
        let bag = KeyBag::memory();
        let err = bag.get_named_key("absent", true, None).await.unwrap_err();
        assert!(matches!(err, KeyBagError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stored_fingerprint_is_verified() {
        let p = provider();
        let k = KeyMaterial::generate();
        let mut stored = StoredKeySet {
            name: "n".into(),
            keys: BTreeMap::new(),
        };
        stored.keys.insert(
            "bogus".into(),
            StoredKey {
                fingerprint: "bogus".into(),
                key: k.to_key_str(),
                default: true,
            },
        );
        p.set(&stored).await.unwrap();
        let bag = KeyBag::new(p);
        let err = bag.get_named_key("n", false, None).await.unwrap_err();
        assert!(matches!(err, KeyBagError::FingerprintMismatch { .. }));
    }

    #[test]
    fn test_stored_form_uses_camel_case_fingerprint() {
        let k = StoredKey {
            fingerprint: "f".into(),
            key: "k".into(),
            default: false,
        };
        let json = serde_json::to_value(&k).unwrap();
        assert_eq!(json["fingerPrint"], "f");
    }
}
