//! Peer meta exchange.
//!
//! A ledger publishes its head as a serialized meta together with its key
//! strings, so a peer that can reach the same replica can both fetch and
//! decrypt the referenced archives. Incoming metas are merged into the car
//! log and their heads folded into the local clock.

use chrono::Utc;
use cinder_core::wire::{decode_meta_payload, encode_meta_payload, MetaFormat, SerializedMetaKey};
use cinder_core::Hash;
use cinder_keybag::BlockCrypto;
use cinder_merger::{Connection, MetaMerger};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DbError, Result};
use crate::ledger::Ledger;

/// What an import changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote car groups folded into the car log.
    pub merged: usize,
    pub head: Vec<Hash>,
}

impl Ledger {
    /// This ledger's head and keys, or `None` before the first commit.
    pub fn outgoing_meta(&self) -> Result<Option<SerializedMetaKey>> {
        let loader = self.store.loader();
        let Some(meta) = loader.serialized_meta()? else {
            return Ok(None);
        };
        let keys = match loader.crypto() {
            BlockCrypto::Keyed(set) => set.key_strings(),
            BlockCrypto::Insecure => Vec::new(),
        };
        Ok(Some(SerializedMetaKey {
            metas: vec![meta],
            keys,
        }))
    }

    /// Encoded form of [`outgoing_meta`](Self::outgoing_meta).
    pub fn export_meta(&self, format: MetaFormat) -> Result<Option<Vec<u8>>> {
        match self.outgoing_meta()? {
            Some(out) => Ok(Some(encode_meta_payload(&out.metas, &out.keys, format)?)),
            None => Ok(None),
        }
    }

    /// Decode a peer payload in either wire shape and apply it.
    pub async fn import_meta(&self, raw: &[u8]) -> Result<SyncReport> {
        let payload = decode_meta_payload(raw)?;
        self.apply_remote(&payload).await
    }

    /// Absorb gossiped keys, merge every unseen meta and advance the head
    /// past the merged events.
    pub async fn apply_remote(&self, payload: &SerializedMetaKey) -> Result<SyncReport> {
        let mut head = self.head.lock().await;
        let merged = self
            .store
            .loader()
            .merge_serialized_metas(payload)
            .await?;
        let mut next = head.clone();
        for meta in &merged {
            for event in meta.head().unwrap_or_default() {
                next = self.crdt.advance(self.store.as_ref(), &next, event).await?;
            }
        }
        if !merged.is_empty() {
            info!(ledger = %self.name(), groups = merged.len(), heads = next.len(), "merged remote head");
        }
        *head = next.clone();
        Ok(SyncReport {
            merged: merged.len(),
            head: next,
        })
    }
}

/// Exchanges a ledger's metas through a [`MetaMerger`] on behalf of one
/// connection.
pub struct MergerSync {
    merger: Arc<MetaMerger>,
    connection: Connection,
}

impl MergerSync {
    pub fn new(merger: Arc<MetaMerger>, connection: Connection) -> Self {
        MergerSync { merger, connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Publish the ledger's current head. Returns how many metas were new.
    pub async fn push(&self, ledger: &Ledger) -> Result<usize> {
        let Some(out) = ledger.outgoing_meta()? else {
            return Ok(0);
        };
        let merger = self.merger.clone();
        let connection = self.connection.clone();
        let added = tokio::task::spawn_blocking(move || merger.add_meta(&connection, &out, Utc::now()))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))??;
        debug!(ledger = %ledger.name(), added, "pushed meta");
        Ok(added)
    }

    /// Fetch whatever this connection has not seen and apply it.
    pub async fn pull(&self, ledger: &Ledger) -> Result<SyncReport> {
        let merger = self.merger.clone();
        let connection = self.connection.clone();
        let delta = tokio::task::spawn_blocking(move || merger.meta_to_send(&connection, Utc::now()))
            .await
            .map_err(|e| DbError::Internal(e.to_string()))??;
        if delta.metas.is_empty() && delta.keys.is_empty() {
            return Ok(SyncReport {
                merged: 0,
                head: ledger.head().await,
            });
        }
        ledger.apply_remote(&delta).await
    }

    /// Forget what was delivered to this connection.
    pub async fn reset(&self) -> Result<usize> {
        let merger = self.merger.clone();
        let connection = self.connection.clone();
        let cleared = tokio::task::spawn_blocking(move || {
            merger.del_meta(&connection, &SerializedMetaKey::default())
        })
        .await
        .map_err(|e| DbError::Internal(e.to_string()))??;
        Ok(cleared)
    }
}
