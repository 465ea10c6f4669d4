//! # cinder-blockstore
//!
//! Transactional, content-addressed block storage persisted as CAR archives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   EncryptedBlockStore                    │
//! │  open transactions ──► TxFetcher (tx, siblings, loader)  │
//! ├──────────────────────────────────────────────────────────┤
//! │                          Loader                          │
//! │  car log · block cache · commit · compaction · merge     │
//! ├───────────────────────┬──────────────────────────────────┤
//! │  Wal (replica uploads)│  BlockCrypto (cinder-keybag)     │
//! ├───────────────────────┴──────────────────────────────────┤
//! │        Gateway (memory://, file://, registered)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use cinder_blockstore::{
//!     CommitOpts, DbMeta, EncryptedBlockStore, GatewayRegistry, LedgerConfigBuilder,
//! };
//! use cinder_core::Block;
//! use cinder_keybag::KeyBag;
//!
//! # async fn demo() -> cinder_blockstore::Result<()> {
//! let registry = GatewayRegistry::new();
//! let config = LedgerConfigBuilder::new("notes").build();
//! let store = EncryptedBlockStore::open(config, &registry, &KeyBag::memory()).await?;
//!
//! let tx = store.open_transaction();
//! let block = Block::new(b"hello".to_vec());
//! tx.put(block.clone());
//! let meta = DbMeta { head: vec![*block.address()] };
//! store.commit_transaction(&tx, meta.into(), CommitOpts::default()).await?;
//! # Ok(())
//! # }
//! ```

mod blockstore;
mod commit;
mod config;
mod error;
mod files;
mod gateway;
mod loader;
mod meta;
mod transaction;
pub mod url;
mod wal;

pub use blockstore::{BlockFetcher, BlockStore, EncryptedBlockStore, TxFetcher};
pub use commit::{
    encode_cars, CarGroup, CarHeaderBlock, CarHeaderBody, CarLog, CommitOpts, DbMeta, EncodedCar,
    IndexMeta, TransactionMeta,
};
pub use config::{
    LedgerConfig, LedgerConfigBuilder, PartialLedgerConfig, StoreKey, DEFAULT_AUTO_COMPACT,
    DEFAULT_CAR_THRESHOLD, DEFAULT_FILE_CHUNK_SIZE, DEFAULT_STORE_URL,
};
pub use error::{GatewayError, Result, StoreError};
pub use files::{FileIndex, FileRef};
pub use gateway::{
    AttachedStore, FileGateway, Gateway, GatewayFactory, GatewayKeyBagProvider, GatewayRegistry,
    MemoryGateway,
};
pub use loader::Loader;
pub use meta::{absorb_gossip_keys, DbMetaRecord};
pub use transaction::Transaction;
pub use self::url::{StoreKind, StoreUrl};
pub use wal::{FileOperation, Wal, WalEntry, WalOperation, WalState};
