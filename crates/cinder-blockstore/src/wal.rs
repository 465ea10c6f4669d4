//! Write-ahead envelope for replica uploads.
//!
//! Every commit is recorded here before its meta is written. Processing
//! copies the recorded archives (and, for loader operations, the meta
//! record) from the local store to each remote. Entries that cannot be
//! uploaded stay pending and are retried on the next call or on reopen.

use bytes::Bytes;
use cinder_core::Hash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::commit::CarGroup;
use crate::error::Result;
use crate::gateway::AttachedStore;
use crate::meta::{DbMetaRecord, MAIN};
use crate::url::StoreKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalOperation {
    pub cars: CarGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub cid: Hash,
    pub public: bool,
}

/// Persisted envelope: `{ fileOperations, noLoaderOps, operations }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalState {
    #[serde(default)]
    pub file_operations: Vec<FileOperation>,
    #[serde(default)]
    pub no_loader_ops: Vec<WalOperation>,
    #[serde(default)]
    pub operations: Vec<WalOperation>,
}

impl WalState {
    pub fn is_empty(&self) -> bool {
        self.file_operations.is_empty() && self.no_loader_ops.is_empty() && self.operations.is_empty()
    }
}

/// What a new envelope entry records.
#[derive(Debug, Clone)]
pub enum WalEntry {
    Operation(CarGroup),
    NoLoader(CarGroup),
    File(Hash),
}

pub struct Wal {
    local: AttachedStore,
    remotes: Vec<AttachedStore>,
    state: tokio::sync::Mutex<WalState>,
}

enum Upload {
    Done,
    /// The local source is gone; the entry can never complete.
    Superseded,
    Failed,
}

impl Wal {
    pub fn new(local: AttachedStore, remotes: Vec<AttachedStore>) -> Self {
        Wal {
            local,
            remotes,
            state: tokio::sync::Mutex::new(WalState::default()),
        }
    }

    /// Read the persisted envelope into memory.
    pub async fn load(&self) -> Result<WalState> {
        let loaded = match self.local.get(StoreKind::Wal, MAIN).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.is_not_found() => WalState::default(),
            Err(e) => return Err(e.into()),
        };
        *self.state.lock().await = loaded.clone();
        Ok(loaded)
    }

    pub async fn pending(&self) -> WalState {
        self.state.lock().await.clone()
    }

    async fn persist(&self, state: &WalState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.local
            .put(StoreKind::Wal, MAIN, Bytes::from(bytes))
            .await?;
        Ok(())
    }

    /// Record an entry durably.
    pub async fn enqueue(&self, entry: WalEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        match entry {
            WalEntry::Operation(cars) => state.operations.push(WalOperation { cars }),
            WalEntry::NoLoader(cars) => state.no_loader_ops.push(WalOperation { cars }),
            WalEntry::File(cid) => state.file_operations.push(FileOperation { cid, public: false }),
        }
        self.persist(&state).await
    }

    /// Drop loader operations for which `keep` returns false.
    pub async fn retain_operations(&self, keep: impl Fn(&CarGroup) -> bool) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.operations.len();
        state.operations.retain(|op| keep(&op.cars));
        let dropped = before - state.operations.len();
        if dropped > 0 {
            self.persist(&state).await?;
        }
        Ok(dropped)
    }

    async fn copy(&self, kind: StoreKind, car: &Hash) -> Upload {
        let id = car.to_hex();
        let bytes = match self.local.get(kind, &id).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Upload::Superseded,
            Err(e) => {
                warn!(car = %car, error = %e, "local read failed during upload");
                return Upload::Failed;
            }
        };
        let mut ok = true;
        for remote in &self.remotes {
            if let Err(e) = remote.put(kind, &id, bytes.clone()).await {
                warn!(remote = %remote.url().base(), car = %car, error = %e, "remote upload failed");
                ok = false;
            }
        }
        if ok {
            Upload::Done
        } else {
            Upload::Failed
        }
    }

    async fn copy_group(&self, kind: StoreKind, cars: &CarGroup) -> Upload {
        for car in cars {
            match self.copy(kind, car).await {
                Upload::Done => {}
                other => return other,
            }
        }
        Upload::Done
    }

    async fn put_remote_meta(&self, cars: &CarGroup) -> Result<()> {
        let record = DbMetaRecord { cars: cars.clone() };
        let bytes = Bytes::from(record.to_bytes()?);
        for remote in &self.remotes {
            remote.put(StoreKind::Meta, MAIN, bytes.clone()).await?;
        }
        Ok(())
    }

    /// Upload pending entries to every remote, oldest first. Returns the
    /// number of entries completed or discarded.
    pub async fn process(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        if state.is_empty() {
            return Ok(0);
        }
        let before = state.operations.len() + state.no_loader_ops.len() + state.file_operations.len();

        if self.remotes.is_empty() {
            *state = WalState::default();
            self.persist(&state).await?;
            return Ok(before);
        }

        let mut files = Vec::new();
        for op in std::mem::take(&mut state.file_operations) {
            match self.copy(StoreKind::File, &op.cid).await {
                Upload::Done => {}
                Upload::Superseded => warn!(car = %op.cid, "file archive missing, dropping upload"),
                Upload::Failed => files.push(op),
            }
        }
        state.file_operations = files;

        let mut no_loader = Vec::new();
        for op in std::mem::take(&mut state.no_loader_ops) {
            match self.copy_group(StoreKind::Data, &op.cars).await {
                Upload::Done | Upload::Superseded => {}
                Upload::Failed => no_loader.push(op),
            }
        }
        state.no_loader_ops = no_loader;

        // loader operations keep their order; stop at the first failure
        let ops = std::mem::take(&mut state.operations);
        let mut remaining = Vec::new();
        let mut blocked = false;
        for op in ops {
            if blocked {
                remaining.push(op);
                continue;
            }
            match self.copy_group(StoreKind::Data, &op.cars).await {
                Upload::Done => {
                    if let Err(e) = self.put_remote_meta(&op.cars).await {
                        warn!(error = %e, "remote meta upload failed");
                        blocked = true;
                        remaining.push(op);
                    }
                }
                Upload::Superseded => {
                    debug!(cars = op.cars.len(), "archives compacted away, dropping upload");
                }
                Upload::Failed => {
                    blocked = true;
                    remaining.push(op);
                }
            }
        }
        state.operations = remaining;

        let after = state.operations.len() + state.no_loader_ops.len() + state.file_operations.len();
        self.persist(&state).await?;
        Ok(before - after)
    }
}
