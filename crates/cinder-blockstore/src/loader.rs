//! The car log and everything that reads or rewrites it.
//!
//! ## Commit protocol
//!
//! 1. encode a header block plus the new blocks into one or more archives
//! 2. write the archives to the local store
//! 3. record the group in the write-ahead envelope
//! 4. write the meta record `{ cars }` under `main`
//! 5. push the group to the front of the car log
//!
//! Any storage failure before step 5 leaves the car log untouched.
//!
//! Commits, compactions and remote merges all run under one write mutex
//! per ledger, so a compaction always sees every commit that preceded it and
//! no commit can land between its snapshot and its swap.

use bytes::Bytes;
use cinder_core::car::CarReader;
use cinder_core::wire::{SerializedMeta, SerializedMetaKey};
use cinder_core::{Block, Hash};
use cinder_keybag::{BlockCrypto, KeyBag};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::commit::{encode_cars, CarGroup, CarHeaderBlock, CarLog, CommitOpts, TransactionMeta};
use crate::config::{LedgerConfig, StoreKey};
use crate::error::{GatewayError, Result, StoreError};
use crate::files::{assemble_range, chunk_file, FileIndex, FileRef};
use crate::gateway::{AttachedStore, GatewayRegistry};
use crate::meta::{absorb_gossip_keys, DbMetaRecord, MAIN};
use crate::url::StoreKind;
use crate::wal::{Wal, WalEntry};

/// A parsed archive whose entries are opened on demand.
struct LoadedCar {
    roots: Vec<Hash>,
    entries: HashMap<Hash, Bytes>,
    order: Vec<Hash>,
}

impl LoadedCar {
    fn from_reader(reader: &CarReader) -> Self {
        let mut entries = HashMap::new();
        let mut order = Vec::new();
        for (address, payload) in reader.entries() {
            if entries.insert(*address, payload.clone()).is_none() {
                order.push(*address);
            }
        }
        LoadedCar {
            roots: reader.roots().to_vec(),
            entries,
            order,
        }
    }
}

/// Owns the car log of one ledger.
pub struct Loader {
    config: LedgerConfig,
    local: AttachedStore,
    remotes: Vec<AttachedStore>,
    crypto: BlockCrypto,
    wal: Wal,
    write_lock: tokio::sync::Mutex<()>,
    car_log: RwLock<CarLog>,
    generation: AtomicU64,
    block_cache: RwLock<HashMap<Hash, Block>>,
    cars: RwLock<HashMap<Hash, Arc<LoadedCar>>>,
    seen_compacted: RwLock<HashSet<Hash>>,
    seen_meta: RwLock<HashSet<String>>,
    head_meta_cids: RwLock<Vec<String>>,
    last_meta: RwLock<Option<TransactionMeta>>,
    ready: tokio::sync::OnceCell<Option<TransactionMeta>>,
}

impl Loader {
    /// Attach the configured stores and resolve the store key.
    pub async fn open(
        config: LedgerConfig,
        registry: &GatewayRegistry,
        keybag: &KeyBag,
    ) -> Result<Self> {
        config.validate()?;
        let local = AttachedStore::resolve(config.local_url(StoreKind::Data)?, registry)?;
        let remotes = config
            .remote_urls(StoreKind::Data)?
            .into_iter()
            .map(|url| AttachedStore::resolve(url, registry))
            .collect::<std::result::Result<Vec<_>, GatewayError>>()?;
        let crypto = match &config.storekey {
            StoreKey::Insecure => BlockCrypto::Insecure,
            StoreKey::Named(name) => BlockCrypto::Keyed(keybag.get_named_key(name, false, None).await?),
        };
        debug!(ledger = %config.name, encrypted = crypto.is_encrypted(), remotes = remotes.len(), "opened loader");
        Ok(Self::with_stores(config, local, remotes, crypto))
    }

    /// Build a loader over already attached stores.
    pub fn with_stores(
        config: LedgerConfig,
        local: AttachedStore,
        remotes: Vec<AttachedStore>,
        crypto: BlockCrypto,
    ) -> Self {
        let wal = Wal::new(local.clone(), remotes.clone());
        Loader {
            config,
            local,
            remotes,
            crypto,
            wal,
            write_lock: tokio::sync::Mutex::new(()),
            car_log: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            block_cache: RwLock::new(HashMap::new()),
            cars: RwLock::new(HashMap::new()),
            seen_compacted: RwLock::new(HashSet::new()),
            seen_meta: RwLock::new(HashSet::new()),
            head_meta_cids: RwLock::new(Vec::new()),
            last_meta: RwLock::new(None),
            ready: tokio::sync::OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn crypto(&self) -> &BlockCrypto {
        &self.crypto
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// Snapshot of the car log, newest first.
    pub fn car_log(&self) -> CarLog {
        self.car_log.read().clone()
    }

    pub fn car_log_len(&self) -> usize {
        self.car_log.read().len()
    }

    /// Bumped every time the car log changes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The meta of the latest commit or merge.
    pub fn last_meta(&self) -> Option<TransactionMeta> {
        self.last_meta.read().clone()
    }

    pub fn is_compacted(&self, car: &Hash) -> bool {
        self.seen_compacted.read().contains(car)
    }

    pub fn cached_blocks(&self) -> usize {
        self.block_cache.read().len()
    }

    /// Load the persisted state once. Returns the committed meta, if any.
    pub async fn ready(&self) -> Result<Option<TransactionMeta>> {
        self.ready
            .get_or_try_init(|| self.load_from_store())
            .await
            .cloned()
    }

    async fn load_from_store(&self) -> Result<Option<TransactionMeta>> {
        let _guard = self.write_lock.lock().await;
        let record = match self.local.get(StoreKind::Meta, MAIN).await {
            Ok(bytes) => Some(DbMetaRecord::from_bytes(&bytes)?),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let meta = match record {
            Some(record) if !record.cars.is_empty() => {
                let header = self.load_header(&record.cars).await?;
                let log = self.merged_log(&record.cars, &[], &header);
                *self.car_log.write() = log;
                self.generation.fetch_add(1, Ordering::SeqCst);
                *self.last_meta.write() = Some(header.fp.meta.clone());
                Some(header.fp.meta)
            }
            _ => None,
        };

        self.wal.load().await?;
        let log = self.car_log();
        let compacted = self.seen_compacted.read().clone();
        let dropped = self
            .wal
            .retain_operations(|group| {
                log.contains(group) || group.iter().any(|car| compacted.contains(car))
            })
            .await?;
        if dropped > 0 {
            warn!(ledger = %self.name(), dropped, "discarded partially applied commits");
        }
        if let Err(e) = self.wal.process().await {
            warn!(ledger = %self.name(), error = %e, "replaying write-ahead envelope failed");
        }

        debug!(ledger = %self.name(), log_len = self.car_log_len(), "loader ready");
        Ok(meta)
    }

    /// Build `[group, ...current, ...header.cars]` without duplicates or
    /// compacted groups, recording the header's compacted cars.
    fn merged_log(&self, group: &CarGroup, current: &[CarGroup], header: &CarHeaderBlock) -> CarLog {
        {
            let mut compacted = self.seen_compacted.write();
            for old in &header.fp.compact {
                compacted.extend(old.iter().copied());
            }
        }
        let compacted = self.seen_compacted.read();
        let mut log: CarLog = Vec::new();
        for g in std::iter::once(group).chain(current.iter()).chain(header.fp.cars.iter()) {
            if g.is_empty() || log.contains(g) || g.iter().any(|car| compacted.contains(car)) {
                continue;
            }
            log.push(g.clone());
        }
        log
    }

    async fn fetch_remote(&self, kind: StoreKind, id: &str) -> Option<Bytes> {
        for remote in &self.remotes {
            match remote.get(kind, id).await {
                Ok(bytes) => return Some(bytes),
                Err(e) if e.is_not_found() => continue,
                Err(e) => warn!(remote = %remote.url().base(), error = %e, "remote read failed"),
            }
        }
        None
    }

    async fn load_car(&self, car: &Hash, kind: StoreKind) -> Result<Arc<LoadedCar>> {
        if let Some(loaded) = self.cars.read().get(car) {
            return Ok(loaded.clone());
        }
        let id = car.to_hex();
        let bytes = match self.local.get(kind, &id).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => match self.fetch_remote(kind, &id).await {
                Some(bytes) => {
                    if let Err(put_err) = self.local.put(kind, &id, bytes.clone()).await {
                        warn!(car = %car, error = %put_err, "could not copy remote archive locally");
                    }
                    bytes
                }
                None if self.is_compacted(car) => {
                    return Err(StoreError::StaleArchive { car: *car, cause: e })
                }
                None => return Err(e.into()),
            },
            Err(e) => return Err(e.into()),
        };

        let reader = CarReader::new(&bytes)?;
        if reader.address() != car {
            return Err(StoreError::ArchiveMismatch {
                expected: *car,
                actual: *reader.address(),
            });
        }
        let loaded = Arc::new(LoadedCar::from_reader(&reader));
        debug!(car = %car, entries = loaded.order.len(), "loaded car");
        self.cars.write().insert(*car, loaded.clone());
        Ok(loaded)
    }

    /// Decrypt and verify one entry of a loaded archive.
    fn open_entry(&self, car: &LoadedCar, address: &Hash) -> Result<Option<Block>> {
        if let Some(block) = self.block_cache.read().get(address) {
            return Ok(Some(block.clone()));
        }
        let Some(sealed) = car.entries.get(address) else {
            return Ok(None);
        };
        let plain = self.crypto.decrypt(address, sealed)?;
        let block = Block::from_parts(*address, plain)?;
        self.block_cache.write().insert(*address, block.clone());
        Ok(Some(block))
    }

    async fn load_header(&self, group: &CarGroup) -> Result<CarHeaderBlock> {
        let first = group
            .first()
            .ok_or_else(|| StoreError::InvalidHeader("empty car group".into()))?;
        let car = self.load_car(first, StoreKind::Data).await?;
        let root = car
            .roots
            .first()
            .ok_or_else(|| StoreError::InvalidHeader(format!("car {first} has no root")))?;
        let block = self
            .open_entry(&car, root)?
            .ok_or(StoreError::MissingBlock(*root))?;
        block
            .decode()
            .map_err(|e| StoreError::InvalidHeader(e.to_string()))
    }

    /// Resolve a block from the cache or the car log, newest group first.
    pub async fn get_block(&self, address: &Hash) -> Result<Option<Block>> {
        if let Some(block) = self.block_cache.read().get(address) {
            return Ok(Some(block.clone()));
        }
        self.ready().await?;
        loop {
            let generation = self.generation();
            match self.search_log(address).await {
                // a concurrent compaction may retire archives we were walking
                Err(e) if e.is_stale() && self.generation() != generation => continue,
                other => return other,
            }
        }
    }

    async fn search_log(&self, address: &Hash) -> Result<Option<Block>> {
        for group in self.car_log() {
            for car in &group {
                let loaded = self.load_car(car, StoreKind::Data).await?;
                if let Some(block) = self.open_entry(&loaded, address)? {
                    return Ok(Some(block));
                }
            }
        }
        Ok(None)
    }

    /// Whether a block sits in an archive of the current car log.
    fn is_durable(&self, address: &Hash) -> bool {
        let log = self.car_log.read();
        let cars = self.cars.read();
        log.iter()
            .flatten()
            .filter_map(|car| cars.get(car))
            .any(|loaded| loaded.entries.contains_key(address))
    }

    /// Write archives for `blocks` to the local store, returning the group
    /// and registering the archives as loaded. Nothing is cached until the
    /// caller has persisted a meta referencing the group.
    async fn write_cars(&self, kind: StoreKind, blocks: &[Block]) -> Result<CarGroup> {
        let cars = encode_cars(blocks, &self.crypto, self.config.car_threshold)?;
        for car in &cars {
            self.local
                .put(kind, &car.address.to_hex(), car.bytes.clone())
                .await?;
        }
        let mut group = Vec::with_capacity(cars.len());
        for car in &cars {
            let reader = CarReader::new(&car.bytes)?;
            self.cars
                .write()
                .insert(car.address, Arc::new(LoadedCar::from_reader(&reader)));
            group.push(car.address);
        }
        Ok(group)
    }

    /// Cache blocks whose archives are now referenced by a persisted meta.
    fn remember(&self, blocks: &[Block]) {
        let mut cache = self.block_cache.write();
        for block in blocks {
            cache.insert(*block.address(), block.clone());
        }
    }

    /// Make `group` the durable head: envelope entry, then meta record.
    async fn persist_head(&self, group: &CarGroup) -> Result<()> {
        self.wal.enqueue(WalEntry::Operation(group.clone())).await?;
        let record = DbMetaRecord { cars: group.clone() };
        if let Err(e) = self
            .local
            .put(StoreKind::Meta, MAIN, Bytes::from(record.to_bytes()?))
            .await
        {
            if let Err(wal_err) = self.wal.retain_operations(|g| g != group).await {
                warn!(error = %wal_err, "could not withdraw envelope entry");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Persist a transaction's blocks with its meta.
    ///
    /// With `opts.compact` the commit rewrites the whole history instead;
    /// `blocks` must then include every block still held by open
    /// transactions.
    pub async fn commit(
        &self,
        blocks: Vec<Block>,
        meta: TransactionMeta,
        opts: CommitOpts,
    ) -> Result<CarGroup> {
        self.ready().await?;
        let group = {
            let _guard = self.write_lock.lock().await;
            if opts.compact {
                self.compact_locked(blocks, meta).await?
            } else {
                self.commit_locked(blocks, meta, opts.no_loader).await?
            }
        };
        if let Err(e) = self.wal.process().await {
            warn!(ledger = %self.name(), error = %e, "replica upload deferred");
        }
        Ok(group)
    }

    async fn commit_locked(
        &self,
        blocks: Vec<Block>,
        meta: TransactionMeta,
        no_loader: bool,
    ) -> Result<CarGroup> {
        let previous = self.car_log();
        let header = Block::encode(&CarHeaderBlock::commit(previous, meta.clone()))?;

        let mut seen = HashSet::new();
        let mut all = vec![header];
        for block in blocks {
            if !self.is_durable(block.address()) && seen.insert(*block.address()) {
                all.push(block);
            }
        }
        let group = self.write_cars(StoreKind::Data, &all).await?;

        if no_loader {
            self.wal.enqueue(WalEntry::NoLoader(group.clone())).await?;
            debug!(ledger = %self.name(), cars = group.len(), "committed without loader");
            return Ok(group);
        }

        self.persist_head(&group).await?;
        let log_len = {
            let mut log = self.car_log.write();
            log.insert(0, group.clone());
            log.len()
        };
        self.remember(&all);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.last_meta.write() = Some(meta);
        *self.head_meta_cids.write() = Vec::new();
        debug!(ledger = %self.name(), cars = group.len(), blocks = all.len() - 1, log_len, "committed");
        Ok(group)
    }

    /// Rewrite every reachable block into a single group.
    ///
    /// Returns `None` when nothing has been committed yet.
    pub async fn compact(&self, open_blocks: Vec<Block>) -> Result<Option<CarGroup>> {
        self.ready().await?;
        let group = {
            let _guard = self.write_lock.lock().await;
            let Some(meta) = self.last_meta() else {
                return Ok(None);
            };
            if self.car_log_len() == 0 {
                return Ok(None);
            }
            self.compact_locked(open_blocks, meta).await?
        };
        if let Err(e) = self.wal.process().await {
            warn!(ledger = %self.name(), error = %e, "replica upload deferred");
        }
        Ok(Some(group))
    }

    async fn compact_locked(&self, extra: Vec<Block>, meta: TransactionMeta) -> Result<CarGroup> {
        let old_log = self.car_log();

        let mut seen = HashSet::new();
        let mut blocks = Vec::new();
        for group in &old_log {
            for (i, car) in group.iter().enumerate() {
                let loaded = self.load_car(car, StoreKind::Data).await?;
                // the first root of a group is its header
                let header = if i == 0 { loaded.roots.first() } else { None };
                for address in &loaded.order {
                    if Some(address) == header || !seen.insert(*address) {
                        continue;
                    }
                    let block = self
                        .open_entry(&loaded, address)?
                        .ok_or(StoreError::MissingBlock(*address))?;
                    blocks.push(block);
                }
            }
        }
        for block in extra {
            if seen.insert(*block.address()) {
                blocks.push(block);
            }
        }

        let header = Block::encode(&CarHeaderBlock::compaction(old_log.clone(), meta.clone()))?;
        let mut all = Vec::with_capacity(blocks.len() + 1);
        all.push(header);
        all.extend(blocks);
        let group = self.write_cars(StoreKind::Data, &all).await?;
        self.persist_head(&group).await?;

        *self.car_log.write() = vec![group.clone()];
        self.remember(&all);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.last_meta.write() = Some(meta);
        *self.head_meta_cids.write() = Vec::new();

        let retired: Vec<Hash> = old_log.iter().flatten().copied().collect();
        {
            let mut compacted = self.seen_compacted.write();
            let mut cars = self.cars.write();
            for car in &retired {
                compacted.insert(*car);
                cars.remove(car);
            }
        }
        for car in &retired {
            let id = car.to_hex();
            if let Err(e) = self.local.delete(StoreKind::Data, &id).await {
                warn!(car = %car, error = %e, "could not delete compacted archive");
            }
            for remote in &self.remotes {
                if let Err(e) = remote.delete(StoreKind::Data, &id).await {
                    warn!(car = %car, error = %e, "could not delete compacted remote archive");
                }
            }
        }
        info!(
            ledger = %self.name(),
            groups = old_log.len(),
            blocks = all.len() - 1,
            "compaction swapped car log"
        );
        Ok(group)
    }

    /// Fold a car group committed elsewhere into the local car log.
    ///
    /// Returns the meta committed with that group, or `None` when the group
    /// is already known or was compacted away.
    pub async fn merge_db_meta(&self, record: DbMetaRecord) -> Result<Option<TransactionMeta>> {
        self.ready().await?;
        let _guard = self.write_lock.lock().await;
        if record.cars.is_empty()
            || self.car_log.read().contains(&record.cars)
            || record.cars.iter().any(|car| self.is_compacted(car))
        {
            return Ok(None);
        }
        let header = self.load_header(&record.cars).await?;
        let current = self.car_log();
        let log = self.merged_log(&record.cars, &current, &header);
        let log_len = log.len();
        *self.car_log.write() = log;
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!(ledger = %self.name(), log_len, "merged remote car group");
        Ok(Some(header.fp.meta))
    }

    /// Apply a batch of serialized metas received from a peer: absorb the
    /// gossiped keys, then merge every meta not seen before.
    pub async fn merge_serialized_metas(
        &self,
        payload: &SerializedMetaKey,
    ) -> Result<Vec<TransactionMeta>> {
        absorb_gossip_keys(&self.crypto, &payload.keys).await;
        let mut merged = Vec::new();
        for meta in &payload.metas {
            if self.seen_meta.read().contains(&meta.cid) {
                continue;
            }
            let record = DbMetaRecord::from_serialized(meta)?;
            if let Some(app_meta) = self.merge_db_meta(record).await? {
                self.head_meta_cids.write().push(meta.cid.clone());
                merged.push(app_meta);
            }
            self.seen_meta.write().insert(meta.cid.clone());
        }
        Ok(merged)
    }

    /// The current head as a wire meta, parented on the metas it follows.
    pub fn serialized_meta(&self) -> Result<Option<SerializedMeta>> {
        let Some(group) = self.car_log.read().first().cloned() else {
            return Ok(None);
        };
        let parents = self.head_meta_cids.read().clone();
        let meta = DbMetaRecord { cars: group }.to_serialized(parents)?;
        self.seen_meta.write().insert(meta.cid.clone());
        Ok(Some(meta))
    }

    /// Store a file as chunk blocks in a separate file archive.
    pub async fn commit_files(&self, data: &[u8]) -> Result<FileRef> {
        let (index, chunks) = chunk_file(data, self.config.file_chunk_size)?;
        let mut blocks = Vec::with_capacity(chunks.len() + 1);
        blocks.push(index.clone());
        blocks.extend(chunks);
        let cars = self.write_cars(StoreKind::File, &blocks).await?;
        for car in &cars {
            self.wal.enqueue(WalEntry::File(*car)).await?;
        }
        self.remember(&blocks);
        if let Err(e) = self.wal.process().await {
            warn!(ledger = %self.name(), error = %e, "replica upload deferred");
        }
        debug!(ledger = %self.name(), size = data.len(), cars = cars.len(), "committed file");
        Ok(FileRef {
            cars,
            index: *index.address(),
            size: data.len() as u64,
        })
    }

    async fn get_file_block(&self, file: &FileRef, address: &Hash) -> Result<Block> {
        for car in &file.cars {
            let loaded = self.load_car(car, StoreKind::File).await?;
            if let Some(block) = self.open_entry(&loaded, address)? {
                return Ok(block);
            }
        }
        Err(StoreError::MissingBlock(*address))
    }

    /// Read `len` bytes at `offset`, opening only the chunks that cover them.
    pub async fn read_file_range(&self, file: &FileRef, offset: u64, len: u64) -> Result<Vec<u8>> {
        let index: FileIndex = self.get_file_block(file, &file.index).await?.decode()?;
        let mut chunks = Vec::new();
        for address in &index.chunks[index.chunk_range(offset, len)] {
            chunks.push(self.get_file_block(file, address).await?.bytes().clone());
        }
        Ok(assemble_range(&index, &chunks, offset, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::DbMeta;
    use crate::gateway::{Gateway, MemoryGateway};
    use crate::url::StoreUrl;

    fn loader(gw: Arc<dyn Gateway>) -> Loader {
        let config = crate::config::LedgerConfigBuilder::new("t").insecure().build();
        let url = StoreUrl::parse("memory://t?name=t&store=data").unwrap();
        Loader::with_stores(config, AttachedStore::new(url, gw), vec![], BlockCrypto::Insecure)
    }

    /// Memory store whose meta writes can be made to fail.
    #[derive(Default)]
    struct MetaOutage {
        inner: MemoryGateway,
        down: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Gateway for MetaOutage {
        async fn get(&self, key: &str) -> std::result::Result<Bytes, GatewayError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, bytes: Bytes) -> std::result::Result<(), GatewayError> {
            if key.contains("/meta/") && self.down.load(Ordering::SeqCst) {
                return Err(GatewayError::Io {
                    key: key.to_string(),
                    message: "meta store unavailable".to_string(),
                });
            }
            self.inner.put(key, bytes).await
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), GatewayError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, GatewayError> {
            self.inner.list(prefix).await
        }
    }

    fn meta(n: u8) -> TransactionMeta {
        TransactionMeta::Db(DbMeta {
            head: vec![cinder_core::Hasher::hash(&[n])],
        })
    }

    #[tokio::test]
    async fn test_commit_advances_log() {
        let l = loader(Arc::new(MemoryGateway::new()));
        assert_eq!(l.ready().await.unwrap(), None);
        for i in 0..3u8 {
            l.commit(vec![Block::new(vec![i])], meta(i), CommitOpts::default())
                .await
                .unwrap();
        }
        assert_eq!(l.car_log_len(), 3);
        assert_eq!(l.last_meta(), Some(meta(2)));
    }

    #[tokio::test]
    async fn test_durable_blocks_not_rewritten() {
        let l = loader(Arc::new(MemoryGateway::new()));
        let b = Block::new(b"same".to_vec());
        l.commit(vec![b.clone()], meta(0), CommitOpts::default()).await.unwrap();
        let group = l.commit(vec![b.clone()], meta(1), CommitOpts::default()).await.unwrap();
        let loaded = l.load_car(&group[0], StoreKind::Data).await.unwrap();
        assert_eq!(loaded.order.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_log_unchanged() {
        let gw = Arc::new(MemoryGateway::new());
        let l = loader(gw.clone());
        l.commit(vec![Block::new(b"a".to_vec())], meta(0), CommitOpts::default())
            .await
            .unwrap();
        let before = l.car_log();
        gw.fail_writes(true);
        let err = l
            .commit(vec![Block::new(b"b".to_vec())], meta(1), CommitOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        assert_eq!(l.car_log(), before);
        assert_eq!(l.last_meta(), Some(meta(0)));
    }

    #[tokio::test]
    async fn test_retry_after_failed_meta_write_persists_blocks() {
        let gw = Arc::new(MetaOutage::default());
        let l = loader(gw.clone());
        l.commit(vec![Block::new(b"a".to_vec())], meta(0), CommitOpts::default())
            .await
            .unwrap();
        let before = l.car_log();

        let x = Block::new(b"x".to_vec());
        gw.down.store(true, Ordering::SeqCst);
        assert!(l.commit(vec![x.clone()], meta(1), CommitOpts::default()).await.is_err());
        assert_eq!(l.car_log(), before);
        assert_eq!(l.get_block(x.address()).await.unwrap(), None);

        gw.down.store(false, Ordering::SeqCst);
        let group = l.commit(vec![x.clone()], meta(1), CommitOpts::default()).await.unwrap();
        let loaded = l.load_car(&group[0], StoreKind::Data).await.unwrap();
        assert!(loaded.entries.contains_key(x.address()));

        let reopened = loader(gw.clone());
        assert_eq!(reopened.ready().await.unwrap(), Some(meta(1)));
        assert_eq!(reopened.get_block(x.address()).await.unwrap(), Some(x));
    }

    #[tokio::test]
    async fn test_oversized_block_writes_nothing() {
        let gw = Arc::new(MemoryGateway::new());
        let l = loader(gw.clone());
        l.ready().await.unwrap();
        let stored = gw.len();
        let big = Block::new(vec![1u8; cinder_core::car::MAX_ALLOC + 1]);
        let err = l
            .commit(vec![big], meta(0), CommitOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Core(cinder_core::CoreError::EntryTooLarge { .. })));
        assert_eq!(gw.len(), stored);
        assert_eq!(l.car_log_len(), 0);
    }

    #[tokio::test]
    async fn test_forged_meta_cid_not_trusted() {
        let gw = Arc::new(MemoryGateway::new());
        let a = loader(gw.clone());
        a.commit(vec![Block::new(b"a".to_vec())], meta(0), CommitOpts::default())
            .await
            .unwrap();
        let honest = a.serialized_meta().unwrap().unwrap();

        let mut forged = DbMetaRecord { cars: vec![] }.to_serialized(vec![]).unwrap();
        forged.cid = honest.cid.clone();
        let b = loader(Arc::new(MemoryGateway::new()));
        let payload = SerializedMetaKey {
            metas: vec![forged],
            keys: vec![],
        };
        let err = b.merge_serialized_metas(&payload).await.unwrap_err();
        assert!(matches!(err, StoreError::Core(cinder_core::CoreError::AddressMismatch { .. })));
        assert!(!b.seen_meta.read().contains(&honest.cid));
        assert_eq!(b.car_log_len(), 0);
    }

    #[tokio::test]
    async fn test_no_loader_commit_keeps_log() {
        let l = loader(Arc::new(MemoryGateway::new()));
        let opts = CommitOpts {
            no_loader: true,
            ..Default::default()
        };
        l.commit(vec![Block::new(b"x".to_vec())], meta(0), opts).await.unwrap();
        assert_eq!(l.car_log_len(), 0);
    }

    #[tokio::test]
    async fn test_compacted_car_is_stale() {
        let l = loader(Arc::new(MemoryGateway::new()));
        let a = Block::new(b"a".to_vec());
        let first = l.commit(vec![a.clone()], meta(0), CommitOpts::default()).await.unwrap();
        l.commit(vec![Block::new(b"b".to_vec())], meta(1), CommitOpts::default())
            .await
            .unwrap();
        l.compact(vec![]).await.unwrap().unwrap();
        assert_eq!(l.car_log_len(), 1);
        assert!(l.is_compacted(&first[0]));

        let err = l.load_car(&first[0], StoreKind::Data).await.err().unwrap();
        match err {
            StoreError::StaleArchive { car, cause } => {
                assert_eq!(car, first[0]);
                assert!(cause.is_not_found());
            }
            other => panic!("expected stale archive, got {other:?}"),
        }
        assert_eq!(l.get_block(a.address()).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_compact_before_commit_is_none() {
        let l = loader(Arc::new(MemoryGateway::new()));
        assert!(l.compact(vec![]).await.unwrap().is_none());
    }
}
