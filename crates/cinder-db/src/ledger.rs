//! The ledger: documents over the clock, persisted by the encrypted block
//! store.

use cinder_blockstore::{
    CommitOpts, DbMeta, EncryptedBlockStore, FileRef, GatewayKeyBagProvider, GatewayRegistry,
    LedgerConfig, StoreKind,
};
use cinder_clock::{ChangesOptions, Crdt, DocUpdate};
use cinder_core::Hash;
use cinder_keybag::KeyBag;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DbError, Result};

/// Field carrying a document's id.
pub const ID_FIELD: &str = "_id";

/// Outcome of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocResponse {
    pub id: String,
    pub clock: Vec<Hash>,
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    pub ids: Vec<String>,
    pub clock: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub rows: Vec<DocUpdate>,
    pub clock: Vec<Hash>,
}

/// A document store backed by a content-addressed block store.
///
/// Writes are serialized by the head mutex; reads take a snapshot of the
/// head and run without it.
pub struct Ledger {
    pub(crate) store: Arc<EncryptedBlockStore>,
    pub(crate) crdt: Crdt,
    pub(crate) head: Mutex<Vec<Hash>>,
}

fn split_id(doc: Value) -> Result<(String, Value)> {
    let Value::Object(mut fields) = doc else {
        return Err(DbError::InvalidDocument("document must be a JSON object".into()));
    };
    let id = match fields.remove(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => id,
        Some(Value::String(_)) | None => ulid::Ulid::new().to_string(),
        Some(other) => {
            return Err(DbError::InvalidDocument(format!("{ID_FIELD} must be a string, got {other}")))
        }
    };
    Ok((id, Value::Object(fields)))
}

fn with_id(id: &str, doc: Value) -> Value {
    match doc {
        Value::Object(mut fields) => {
            fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            Value::Object(fields)
        }
        other => {
            let mut fields = Map::new();
            fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            fields.insert("value".to_string(), other);
            Value::Object(fields)
        }
    }
}

impl Ledger {
    /// Open a ledger whose keys live in the `keybag` store next to its data.
    pub async fn open(config: LedgerConfig, registry: &GatewayRegistry) -> Result<Self> {
        let keybag_url = config.local_url(StoreKind::KeyBag)?;
        let gateway = registry.resolve(&keybag_url)?;
        let provider = GatewayKeyBagProvider::new(&keybag_url, gateway);
        let keybag = KeyBag::new(Arc::new(provider));
        Self::open_with_keybag(config, registry, &keybag).await
    }

    pub async fn open_with_keybag(
        config: LedgerConfig,
        registry: &GatewayRegistry,
        keybag: &KeyBag,
    ) -> Result<Self> {
        let store = EncryptedBlockStore::open(config, registry, keybag).await?;
        let meta = store.ready().await?;
        let head = meta
            .as_ref()
            .and_then(|m| m.head())
            .map(<[Hash]>::to_vec)
            .unwrap_or_default();
        debug!(ledger = %store.loader().name(), heads = head.len(), "opened ledger");
        Ok(Ledger {
            store: Arc::new(store),
            crdt: Crdt::new(),
            head: Mutex::new(head),
        })
    }

    pub fn name(&self) -> &str {
        self.store.loader().name()
    }

    pub fn store(&self) -> &Arc<EncryptedBlockStore> {
        &self.store
    }

    pub async fn head(&self) -> Vec<Hash> {
        self.head.lock().await.clone()
    }

    pub fn car_log_len(&self) -> usize {
        self.store.loader().car_log_len()
    }

    /// Write one document. A missing `_id` gets a fresh one.
    pub async fn put(&self, doc: Value) -> Result<DocResponse> {
        let (id, body) = split_id(doc)?;
        let clock = self.write(&[DocUpdate::put(id.clone(), body)]).await?;
        Ok(DocResponse { id, clock })
    }

    /// Write several documents as one event.
    pub async fn bulk(&self, docs: Vec<Value>) -> Result<BulkResponse> {
        let mut ids = Vec::with_capacity(docs.len());
        let mut updates = Vec::with_capacity(docs.len());
        for doc in docs {
            let (id, body) = split_id(doc)?;
            ids.push(id.clone());
            updates.push(DocUpdate::put(id, body));
        }
        let clock = self.write(&updates).await?;
        Ok(BulkResponse { ids, clock })
    }

    pub async fn del(&self, id: &str) -> Result<DocResponse> {
        let clock = self.write(&[DocUpdate::delete(id)]).await?;
        Ok(DocResponse {
            id: id.to_string(),
            clock,
        })
    }

    /// Apply updates as one event and commit it. The transaction is dropped
    /// again if either step fails, leaving the head untouched.
    pub(crate) async fn write(&self, updates: &[DocUpdate]) -> Result<Vec<Hash>> {
        let mut head = self.head.lock().await;
        let tx = self.store.open_transaction();
        let fetcher = self.store.fetcher(&tx);
        let result = match self.crdt.apply_bulk_update(&fetcher, &tx, &head, updates).await {
            Ok(result) => result,
            Err(e) => {
                self.store.abort_transaction(&tx);
                return Err(e.into());
            }
        };
        let meta = DbMeta {
            head: result.head.clone(),
        };
        if let Err(e) = self
            .store
            .commit_transaction(&tx, meta.into(), CommitOpts::default())
            .await
        {
            self.store.abort_transaction(&tx);
            return Err(e.into());
        }
        debug!(ledger = %self.name(), event = %result.event.short(), docs = updates.len(), "committed");
        *head = result.head.clone();
        Ok(result.head)
    }

    /// Current document, with its `_id`.
    pub async fn get(&self, id: &str) -> Result<Value> {
        let head = self.head().await;
        let doc = self.crdt.get_value(self.store.as_ref(), &head, id).await?;
        Ok(with_id(id, doc))
    }

    /// Latest version of every document changed since `since`, oldest
    /// first.
    pub async fn changes(&self, since: &[Hash], opts: ChangesOptions) -> Result<ChangesResponse> {
        let head = self.head().await;
        let rows = self
            .crdt
            .changes_since(self.store.as_ref(), &head, since, opts)
            .await?
            .into_iter()
            .map(|mut row| {
                row.value = row.value.map(|doc| with_id(&row.id, doc));
                row
            })
            .collect();
        Ok(ChangesResponse { rows, clock: head })
    }

    /// Every live document, sorted by id.
    pub async fn all_docs(&self) -> Result<Vec<Value>> {
        let head = self.head().await;
        let entries = self.crdt.all_entries(self.store.as_ref(), &head).await?;
        Ok(entries.into_iter().map(|(id, doc)| with_id(&id, doc)).collect())
    }

    /// Text rendering of the event DAG.
    pub async fn clock_vis(&self) -> Result<Vec<String>> {
        let head = self.head().await;
        Ok(self.crdt.clock_vis(self.store.as_ref(), &head).await?)
    }

    /// Rewrite the car log into a single group.
    pub async fn compact(&self) -> Result<bool> {
        let group = self.store.compact().await?;
        Ok(group.is_some())
    }

    pub async fn put_file(&self, data: &[u8]) -> Result<FileRef> {
        Ok(self.store.loader().commit_files(data).await?)
    }

    pub async fn read_file(&self, file: &FileRef, offset: u64, len: u64) -> Result<Vec<u8>> {
        Ok(self.store.loader().read_file_range(file, offset, len).await?)
    }
}
