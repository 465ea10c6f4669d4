//! # cinder-db
//!
//! Ledger API for the Cinder document store.
//!
//! A [`Ledger`] is a named collection of JSON documents. Each write becomes
//! one event in the ledger's Merkle clock and one commit in its encrypted
//! block store; peers exchange heads as serialized metas, directly or through
//! a server-side [`MetaMerger`](cinder_merger::MetaMerger).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Ledger                     │
//! │  put / bulk / del / get / changes / all_docs │
//! └──────────────┬──────────────────┬────────────┘
//!                │                  │
//!          ┌─────▼─────┐     ┌──────▼──────┐     ┌──────────────┐
//!          │   Crdt    │     │ MergerSync  │────►│  MetaMerger  │
//!          └─────┬─────┘     └──────┬──────┘     └──────────────┘
//!                │                  │
//!          ┌─────▼──────────────────▼─────┐
//!          │     EncryptedBlockStore      │
//!          └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use cinder_blockstore::{GatewayRegistry, LedgerConfigBuilder};
//! use cinder_db::Ledger;
//! use serde_json::json;
//!
//! # async fn demo() -> cinder_db::Result<()> {
//! let registry = GatewayRegistry::new();
//! let ledger = Ledger::open(LedgerConfigBuilder::new("todos").build(), &registry).await?;
//!
//! ledger.put(json!({"_id": "milk", "done": false})).await?;
//! let doc = ledger.get("milk").await?;
//! assert_eq!(doc["done"], json!(false));
//! # Ok(())
//! # }
//! ```

mod error;
mod ledger;
mod sync;

pub use cinder_clock::{ChangesOptions, DocUpdate};
pub use error::{DbError, Result};
pub use ledger::{BulkResponse, ChangesResponse, DocResponse, Ledger, ID_FIELD};
pub use sync::{MergerSync, SyncReport};
