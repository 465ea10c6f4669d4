//! The meta record stored under `main` and its wire form.

use cinder_core::wire::SerializedMeta;
use cinder_keybag::BlockCrypto;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::commit::CarGroup;
use crate::error::Result;

/// Meta store key holding the current record.
pub const MAIN: &str = "main";

/// Points at the car group of the latest commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMetaRecord {
    pub cars: CarGroup,
}

impl DbMetaRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Wire form: the JSON record, base64 encoded, addressed by its hash.
    pub fn to_serialized(&self, parents: Vec<String>) -> Result<SerializedMeta> {
        Ok(SerializedMeta::from_payload(&self.to_bytes()?, parents))
    }

    /// Decode a wire meta whose cid matches its payload.
    pub fn from_serialized(meta: &SerializedMeta) -> Result<Self> {
        Self::from_bytes(&meta.verified_payload()?)
    }
}

/// Upsert gossiped key strings as non-default keys of the store's key set.
///
/// Failures are logged and skipped; returns how many keys were new.
pub async fn absorb_gossip_keys(crypto: &BlockCrypto, keys: &[String]) -> usize {
    let set = match crypto {
        BlockCrypto::Keyed(set) => set,
        BlockCrypto::Insecure => {
            if !keys.is_empty() {
                warn!(count = keys.len(), "ignoring gossiped keys for an insecure store");
            }
            return 0;
        }
    };
    let mut added = 0;
    for key in keys {
        match set.upsert_str(key, false).await {
            Ok(r) if r.modified => {
                info!(name = set.name(), fpr = %r.fingerprint, "absorbed gossiped key");
                added += 1;
            }
            Ok(_) => {}
            Err(e) => warn!(name = set.name(), error = %e, "failed to upsert gossiped key"),
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::Hasher;
    use cinder_keybag::{KeyBag, KeyMaterial};

    #[test]
    fn test_record_wire_roundtrip() {
        let record = DbMetaRecord {
            cars: vec![Hasher::hash(b"car")],
        };
        let wire = record.to_serialized(vec!["parent".into()]).unwrap();
        assert_eq!(wire.parents, vec!["parent".to_string()]);
        assert_eq!(DbMetaRecord::from_serialized(&wire).unwrap(), record);
    }

    #[test]
    fn test_forged_cid_rejected() {
        let record = DbMetaRecord {
            cars: vec![Hasher::hash(b"car")],
        };
        let mut wire = record.to_serialized(vec![]).unwrap();
        wire.cid = Hasher::hash(b"another record").to_hex();
        assert!(matches!(
            DbMetaRecord::from_serialized(&wire),
            Err(crate::error::StoreError::Core(cinder_core::CoreError::AddressMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_absorb_adds_non_default() {
        let bag = KeyBag::memory();
        let set = bag.get_named_key("k", false, None).await.unwrap();
        let own = set.default_key().unwrap().fingerprint;
        let crypto = BlockCrypto::Keyed(set.clone());

        let foreign = KeyMaterial::generate();
        let keys = vec![foreign.to_key_str(), "not-a-key".to_string()];
        assert_eq!(absorb_gossip_keys(&crypto, &keys).await, 1);
        assert_eq!(absorb_gossip_keys(&crypto, &keys).await, 0);
        assert_eq!(set.default_key().unwrap().fingerprint, own);
        assert!(set.get(Some(&foreign.fingerprint())).is_some());
    }

    #[tokio::test]
    async fn test_absorb_insecure_is_noop() {
        let keys = vec![KeyMaterial::generate().to_key_str()];
        assert_eq!(absorb_gossip_keys(&BlockCrypto::Insecure, &keys).await, 0);
    }
}
