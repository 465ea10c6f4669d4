//! # cinder-merger
//!
//! Server-side fan-out of ledger heads.
//!
//! Clients push the metas (head references) they commit, together with any
//! key strings they want to gossip. The merger keeps them per
//! `(tenant, ledger)` in SQLite and hands every connection each meta and key
//! exactly once.
//!
//! ## Example
//!
//! ```rust
//! use chrono::Utc;
//! use cinder_core::wire::{SerializedMeta, SerializedMetaKey};
//! use cinder_merger::{Connection, MetaMerger};
//!
//! let merger = MetaMerger::open_in_memory("server-1").unwrap();
//! let writer = Connection::new("acme", "todos", "req-1", "res-1");
//! let reader = Connection::new("acme", "todos", "req-2", "res-2");
//!
//! let pushed = SerializedMetaKey {
//!     metas: vec![SerializedMeta::from_payload(b"head", vec![])],
//!     keys: vec![],
//! };
//! merger.add_meta(&writer, &pushed, Utc::now()).unwrap();
//!
//! assert_eq!(merger.meta_to_send(&reader, Utc::now()).unwrap().metas.len(), 1);
//! assert!(merger.meta_to_send(&reader, Utc::now()).unwrap().metas.is_empty());
//! ```

mod error;
mod merger;
pub mod schema;

pub use error::{MergerError, Result};
pub use merger::{Connection, ConnectionId, MetaMerger, TenantLedger};
