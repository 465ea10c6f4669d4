//! Sharded key index.
//!
//! Each event carries the root of an index mapping document keys to value
//! blocks. The root points at up to [`SHARDS`] shard blocks, chosen by the
//! high nibble of the key hash; an update rewrites only the shards it
//! touches plus a new root.

use cinder_blockstore::{BlockFetcher, Transaction};
use cinder_core::{Block, Hash, Hasher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

pub const SHARDS: usize = 16;

/// Where a key currently points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub value: Hash,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub del: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub entries: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoot {
    pub shards: Vec<Option<Hash>>,
}

impl Default for IndexRoot {
    fn default() -> Self {
        IndexRoot {
            shards: vec![None; SHARDS],
        }
    }
}

/// Materialized key map.
pub type IndexMap = BTreeMap<String, IndexEntry>;

pub fn shard_of(key: &str) -> usize {
    Hasher::hash(key.as_bytes()).nibble()
}

async fn load_root(fetcher: &dyn BlockFetcher, root: &Hash) -> Result<IndexRoot> {
    let block = fetcher.require(root).await?;
    Ok(block.decode()?)
}

async fn load_shard(fetcher: &dyn BlockFetcher, address: &Option<Hash>) -> Result<Shard> {
    match address {
        Some(address) => Ok(fetcher.require(address).await?.decode()?),
        None => Ok(Shard::default()),
    }
}

/// Look one key up, reading only its shard.
pub async fn lookup(
    fetcher: &dyn BlockFetcher,
    root: &Hash,
    key: &str,
) -> Result<Option<IndexEntry>> {
    let root = load_root(fetcher, root).await?;
    let slot = root.shards.get(shard_of(key)).cloned().flatten();
    let shard = load_shard(fetcher, &slot).await?;
    Ok(shard.entries.get(key).cloned())
}

/// Read the whole index into memory.
pub async fn load_all(fetcher: &dyn BlockFetcher, root: &Hash) -> Result<IndexMap> {
    let root = load_root(fetcher, root).await?;
    let mut out = IndexMap::new();
    for slot in &root.shards {
        let shard = load_shard(fetcher, slot).await?;
        out.extend(shard.entries);
    }
    Ok(out)
}

/// Apply `changes` in order on top of `base`, writing the new shards and
/// root into `tx`. Returns the new root.
pub async fn update(
    fetcher: &dyn BlockFetcher,
    tx: &Transaction,
    base: Option<&Hash>,
    changes: &[(String, IndexEntry)],
) -> Result<Hash> {
    let mut root = match base {
        Some(address) => load_root(fetcher, address).await?,
        None => IndexRoot::default(),
    };
    root.shards.resize(SHARDS, None);

    let mut touched: BTreeMap<usize, Vec<&(String, IndexEntry)>> = BTreeMap::new();
    for change in changes {
        touched.entry(shard_of(&change.0)).or_default().push(change);
    }
    for (slot, group) in touched {
        let mut shard = load_shard(fetcher, &root.shards[slot]).await?;
        for (key, entry) in group {
            shard.entries.insert(key.clone(), entry.clone());
        }
        let block = Block::encode(&shard)?;
        root.shards[slot] = Some(*block.address());
        tx.put(block);
    }
    let block = Block::encode(&root)?;
    let address = *block.address();
    tx.put(block);
    Ok(address)
}

/// Write a complete index from a materialized map.
pub fn build(tx: &Transaction, entries: &IndexMap) -> Result<Hash> {
    let mut shards: Vec<Shard> = vec![Shard::default(); SHARDS];
    for (key, entry) in entries {
        shards[shard_of(key)]
            .entries
            .insert(key.clone(), entry.clone());
    }
    let mut root = IndexRoot::default();
    for (slot, shard) in shards.into_iter().enumerate() {
        if shard.entries.is_empty() {
            continue;
        }
        let block = Block::encode(&shard)?;
        root.shards[slot] = Some(*block.address());
        tx.put(block);
    }
    let block = Block::encode(&root)?;
    let address = *block.address();
    tx.put(block);
    Ok(address)
}
