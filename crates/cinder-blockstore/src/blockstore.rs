//! Block stores: the open-transaction set and its encrypted, loader-backed
//! decorator.

use async_trait::async_trait;
use cinder_core::{Block, Hash};
use cinder_keybag::KeyBag;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::commit::{CarGroup, CommitOpts, TransactionMeta};
use crate::config::LedgerConfig;
use crate::error::{Result, StoreError};
use crate::gateway::GatewayRegistry;
use crate::loader::Loader;
use crate::transaction::Transaction;

/// Read access to blocks by address.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn get_block(&self, address: &Hash) -> Result<Option<Block>>;

    /// Like [`get_block`](Self::get_block) but absence is an error.
    async fn require(&self, address: &Hash) -> Result<Block> {
        self.get_block(address)
            .await?
            .ok_or(StoreError::MissingBlock(*address))
    }
}

/// The set of open transactions of one store.
#[derive(Default)]
pub struct BlockStore {
    transactions: RwLock<Vec<Arc<Transaction>>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes must go through a transaction; this always fails.
    pub fn put(&self, block: &Block) -> Result<()> {
        error!(address = %block.address(), "put outside of a transaction");
        Err(StoreError::DirectPut)
    }

    /// Register a fresh transaction in the open set.
    pub fn open_transaction(&self) -> Arc<Transaction> {
        let tx = Arc::new(Transaction::new());
        self.transactions.write().push(tx.clone());
        tx
    }

    /// Remove a transaction from the open set.
    pub fn close(&self, tx: &Transaction) {
        let id = tx.id();
        self.transactions.write().retain(|t| t.id() != id);
    }

    /// Look a block up in every open transaction.
    pub fn get_local(&self, address: &Hash) -> Option<Block> {
        self.transactions
            .read()
            .iter()
            .find_map(|tx| tx.get(address))
    }

    /// Blocks of all open transactions, deduplicated by address.
    pub fn entries(&self) -> Vec<Block> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tx in self.transactions.read().iter() {
            for block in tx.entries() {
                if seen.insert(*block.address()) {
                    out.push(block);
                }
            }
        }
        out
    }

    pub fn open_count(&self) -> usize {
        self.transactions.read().len()
    }
}

/// Resolves reads for one transaction: the transaction itself, then its
/// open siblings, then the loader.
pub struct TxFetcher {
    tx: Arc<Transaction>,
    base: Arc<BlockStore>,
    loader: Arc<Loader>,
}

impl TxFetcher {
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }
}

#[async_trait]
impl BlockFetcher for TxFetcher {
    async fn get_block(&self, address: &Hash) -> Result<Option<Block>> {
        if let Some(block) = self.tx.get(address) {
            return Ok(Some(block));
        }
        if let Some(block) = self.base.get_local(address) {
            return Ok(Some(block));
        }
        self.loader.get_block(address).await
    }
}

/// A block store whose blocks are sealed on their way to the loader and
/// opened on their way back.
///
/// Encryption itself happens in the loader's archive codec using the store's
/// [`BlockCrypto`](cinder_keybag::BlockCrypto); an insecure store passes
/// payloads through unchanged.
pub struct EncryptedBlockStore {
    base: Arc<BlockStore>,
    loader: Arc<Loader>,
    compacting: Arc<AtomicBool>,
    compaction: Mutex<Option<JoinHandle<()>>>,
}

impl EncryptedBlockStore {
    pub async fn open(
        config: LedgerConfig,
        registry: &GatewayRegistry,
        keybag: &KeyBag,
    ) -> Result<Self> {
        let loader = Loader::open(config, registry, keybag).await?;
        Ok(Self::new(Arc::new(loader)))
    }

    pub fn new(loader: Arc<Loader>) -> Self {
        EncryptedBlockStore {
            base: Arc::new(BlockStore::new()),
            loader,
            compacting: Arc::new(AtomicBool::new(false)),
            compaction: Mutex::new(None),
        }
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    pub async fn ready(&self) -> Result<Option<TransactionMeta>> {
        self.loader.ready().await
    }

    pub fn put(&self, block: &Block) -> Result<()> {
        self.base.put(block)
    }

    pub fn open_transaction(&self) -> Arc<Transaction> {
        self.base.open_transaction()
    }

    /// Discard a transaction without persisting it.
    pub fn abort_transaction(&self, tx: &Transaction) {
        debug!(tx = %tx.id(), "aborting transaction");
        self.base.close(tx);
    }

    pub fn fetcher(&self, tx: &Arc<Transaction>) -> TxFetcher {
        TxFetcher {
            tx: tx.clone(),
            base: self.base.clone(),
            loader: self.loader.clone(),
        }
    }

    pub fn entries(&self) -> Vec<Block> {
        self.base.entries()
    }

    pub fn open_transactions(&self) -> usize {
        self.base.open_count()
    }

    /// Persist a transaction. It leaves the open set only once the loader
    /// has made it durable.
    pub async fn commit_transaction(
        &self,
        tx: &Arc<Transaction>,
        meta: TransactionMeta,
        opts: CommitOpts,
    ) -> Result<CarGroup> {
        let blocks = if opts.compact {
            self.base.entries()
        } else {
            tx.entries()
        };
        let group = self.loader.commit(blocks, meta, opts).await?;
        self.base.close(tx);
        if !opts.compact && !opts.no_loader {
            self.maybe_compact();
        }
        Ok(group)
    }

    /// Compact now, including blocks of still-open transactions.
    pub async fn compact(&self) -> Result<Option<CarGroup>> {
        self.loader.compact(self.base.entries()).await
    }

    fn maybe_compact(&self) {
        let threshold = self.loader.config().auto_compact;
        if self.loader.car_log_len() <= threshold {
            return;
        }
        if self.compacting.swap(true, Ordering::SeqCst) {
            return;
        }
        let base = self.base.clone();
        let loader = self.loader.clone();
        let flag = self.compacting.clone();
        debug!(ledger = %loader.name(), threshold, "scheduling compaction");
        let handle = tokio::spawn(async move {
            match loader.compact(base.entries()).await {
                Ok(_) => {}
                Err(e) => warn!(ledger = %loader.name(), error = %e, "auto compaction failed"),
            }
            flag.store(false, Ordering::SeqCst);
        });
        *self.compaction.lock() = Some(handle);
    }

    /// Wait for a scheduled compaction, if one is running.
    pub async fn wait_for_compaction(&self) {
        let handle = self.compaction.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "compaction task panicked");
            }
        }
    }
}

#[async_trait]
impl BlockFetcher for EncryptedBlockStore {
    async fn get_block(&self, address: &Hash) -> Result<Option<Block>> {
        if let Some(block) = self.base.get_local(address) {
            return Ok(Some(block));
        }
        self.loader.get_block(address).await
    }
}
