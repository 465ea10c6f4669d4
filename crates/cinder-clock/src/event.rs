//! Event and value blocks.

use cinder_blockstore::BlockFetcher;
use cinder_core::{Block, Hash};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// One key assignment. Deletes point at a tombstone value block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub key: String,
    pub value: Hash,
}

/// Payload of an event: a single operation or a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventData {
    Put(Operation),
    Batch { ops: Vec<Operation> },
}

impl EventData {
    /// Operations newest first: a later entry of a batch supersedes an
    /// earlier one for the same key.
    pub fn ops_newest_first(&self) -> Vec<&Operation> {
        match self {
            EventData::Put(op) => vec![op],
            EventData::Batch { ops } => ops.iter().rev().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EventData::Put(_) => 1,
            EventData::Batch { ops } => ops.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A node of the Merkle-DAG clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub parents: Vec<Hash>,
    pub data: EventData,
    /// Root of the key index as of this event.
    pub index: Hash,
}

impl Event {
    pub fn to_block(&self) -> Result<Block> {
        Ok(Block::encode(self)?)
    }

    pub async fn load(fetcher: &dyn BlockFetcher, address: &Hash) -> Result<Event> {
        let block = fetcher.require(address).await?;
        Ok(block.decode()?)
    }
}

/// Value block: `{ doc }` for a live document, `{ del: true }` for a
/// tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub del: bool,
}

impl ValueBlock {
    pub fn doc(doc: Value) -> Self {
        ValueBlock {
            doc: Some(doc),
            del: false,
        }
    }

    pub fn tombstone() -> Self {
        ValueBlock {
            doc: None,
            del: true,
        }
    }
}
