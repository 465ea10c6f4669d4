//! # cinder-clock
//!
//! Merkle-DAG clock and document index for Cinder ledgers.
//!
//! Every write to a ledger becomes an [`Event`] block naming its parent
//! events, so the history of a ledger is a DAG whose tips (the *head*) are
//! enough to reconstruct its state. Each event also carries the root of a
//! sharded key index so single-head reads touch only one shard.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   apply_bulk_update   ┌──────────────┐
//! │   Ledger    │──────────────────────►│     Crdt     │
//! └─────────────┘                       └──────┬───────┘
//!                                              │ events, shards, values
//!                                              ▼
//!                                   ┌───────────────────────┐
//!                                   │ BlockFetcher + tx     │
//!                                   └───────────────────────┘
//! ```
//!
//! Concurrent tips are resolved first-seen-wins: walking breadth first from
//! every tip, the first value met for a key is its current value.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cinder_blockstore::{EncryptedBlockStore, GatewayRegistry, LedgerConfigBuilder};
//! use cinder_clock::{Crdt, DocUpdate};
//! use cinder_keybag::KeyBag;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = GatewayRegistry::new();
//! let config = LedgerConfigBuilder::new("docs").build();
//! let store = EncryptedBlockStore::open(config, &registry, &KeyBag::memory()).await?;
//!
//! let crdt = Crdt::new();
//! let tx = store.open_transaction();
//! let fetcher = store.fetcher(&tx);
//! let update = DocUpdate::put("doc-1", serde_json::json!({"title": "hello"}));
//! let result = crdt.apply_bulk_update(&fetcher, &tx, &[], &[update]).await?;
//! let doc = crdt.get_value(&fetcher, &result.head, "doc-1").await?;
//! # Ok(())
//! # }
//! ```

mod crdt;
mod error;
mod event;
pub mod index;

pub use crdt::{BulkResult, ChangesOptions, Crdt, DocUpdate, IndexCache};
pub use error::{ClockError, Result};
pub use event::{Event, EventData, Operation, ValueBlock};
