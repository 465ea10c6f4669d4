//! Commit encoding: header blocks, car groups and archive splitting.

use bytes::Bytes;
use cinder_core::car::{entry_len, CarWriter};
use cinder_core::{Block, Hash, Hasher};
use cinder_keybag::BlockCrypto;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Archives persisted together by one commit.
pub type CarGroup = Vec<Hash>;

/// Newest-first history of car groups.
pub type CarLog = Vec<CarGroup>;

/// Meta of a data ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMeta {
    pub head: Vec<Hash>,
}

/// One named index carried in an index ledger meta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    #[serde(rename = "byId", default, skip_serializing_if = "Option::is_none")]
    pub by_id: Option<Hash>,
    #[serde(rename = "byKey", default, skip_serializing_if = "Option::is_none")]
    pub by_key: Option<Hash>,
    pub head: Vec<Hash>,
    pub name: String,
    pub map: String,
}

/// Application meta committed with a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransactionMeta {
    Db(DbMeta),
    Index {
        indexes: BTreeMap<String, IndexMeta>,
    },
}

impl TransactionMeta {
    pub fn head(&self) -> Option<&[Hash]> {
        match self {
            TransactionMeta::Db(meta) => Some(&meta.head),
            TransactionMeta::Index { .. } => None,
        }
    }
}

impl From<DbMeta> for TransactionMeta {
    fn from(meta: DbMeta) -> Self {
        TransactionMeta::Db(meta)
    }
}

/// Body of the header block that opens every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeaderBlock {
    pub fp: CarHeaderBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeaderBody {
    /// The log this commit was appended to.
    pub cars: CarLog,
    /// The log this commit superseded, for compactions.
    pub compact: CarLog,
    pub meta: TransactionMeta,
}

impl CarHeaderBlock {
    pub fn commit(previous: CarLog, meta: TransactionMeta) -> Self {
        CarHeaderBlock {
            fp: CarHeaderBody {
                cars: previous,
                compact: Vec::new(),
                meta,
            },
        }
    }

    pub fn compaction(superseded: CarLog, meta: TransactionMeta) -> Self {
        CarHeaderBlock {
            fp: CarHeaderBody {
                cars: Vec::new(),
                compact: superseded,
                meta,
            },
        }
    }
}

/// Options for [`Loader::commit`](crate::Loader::commit).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOpts {
    /// Perform a full compaction instead of an append.
    pub compact: bool,
    /// Persist the archives without advancing the car log or the meta.
    pub no_loader: bool,
}

/// A finished archive ready for storage.
#[derive(Debug, Clone)]
pub struct EncodedCar {
    pub address: Hash,
    pub bytes: Bytes,
}

/// Write `blocks` into one or more archives of at most `threshold` bytes.
///
/// Every entry is sealed with `crypto`. The first archive is rooted at the
/// first block (the header for commits); every later archive is rooted at
/// its own first entry.
pub fn encode_cars(
    blocks: &[Block],
    crypto: &BlockCrypto,
    threshold: usize,
) -> Result<Vec<EncodedCar>> {
    let mut cars = Vec::new();
    let mut writer: Option<CarWriter> = None;

    for block in blocks {
        let payload = crypto.encrypt(block.address(), block.bytes())?;
        let size = entry_len(payload.len());
        if let Some(w) = writer.as_ref() {
            if w.body_len() > 0 && w.body_len() + size > threshold {
                if let Some(full) = writer.take() {
                    cars.push(finish(full));
                }
            }
        }
        writer
            .get_or_insert_with(|| CarWriter::new(vec![*block.address()]))
            .write(block.address(), &payload)?;
    }
    if let Some(w) = writer {
        cars.push(finish(w));
    }
    Ok(cars)
}

fn finish(writer: CarWriter) -> EncodedCar {
    let bytes = writer.finish();
    EncodedCar {
        address: Hasher::hash(&bytes),
        bytes,
    }
}
