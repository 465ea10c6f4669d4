//! Per-write block buffers.

use cinder_core::{Block, Hash};
use parking_lot::RwLock;
use std::collections::HashMap;
use ulid::Ulid;

use crate::error::{Result, StoreError};

#[derive(Default)]
struct TxState {
    blocks: HashMap<Hash, Block>,
    order: Vec<Hash>,
    unshifted: Option<Block>,
}

/// An in-memory map of blocks written by one logical write.
///
/// A transaction may also carry a single "unshift" block which is yielded
/// before every other entry.
pub struct Transaction {
    id: Ulid,
    state: RwLock<TxState>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            id: Ulid::new(),
            state: RwLock::new(TxState::default()),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn put(&self, block: Block) {
        let mut state = self.state.write();
        let address = *block.address();
        if state.blocks.insert(address, block).is_none() {
            state.order.push(address);
        }
    }

    /// Set the block to be iterated first. Only one is allowed.
    pub fn unshift(&self, block: Block) -> Result<()> {
        let mut state = self.state.write();
        if state.unshifted.is_some() {
            return Err(StoreError::DoubleUnshift(self.id.to_string()));
        }
        state.unshifted = Some(block);
        Ok(())
    }

    /// Look a block up in this buffer only.
    pub fn get(&self, address: &Hash) -> Option<Block> {
        let state = self.state.read();
        if let Some(block) = state.blocks.get(address) {
            return Some(block.clone());
        }
        state
            .unshifted
            .as_ref()
            .filter(|b| b.address() == address)
            .cloned()
    }

    /// All blocks, unshift block first, then in insertion order.
    pub fn entries(&self) -> Vec<Block> {
        let state = self.state.read();
        let mut out = Vec::with_capacity(state.order.len() + 1);
        if let Some(first) = &state.unshifted {
            out.push(first.clone());
        }
        for address in &state.order {
            if state.unshifted.as_ref().map(|b| b.address()) == Some(address) {
                continue;
            }
            if let Some(block) = state.blocks.get(address) {
                out.push(block.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        let state = self.state.read();
        let extra = match &state.unshifted {
            Some(b) if !state.blocks.contains_key(b.address()) => 1,
            _ => 0,
        };
        state.blocks.len() + extra
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let tx = Transaction::new();
        let b = Block::new(b"one".to_vec());
        tx.put(b.clone());
        tx.put(b.clone());
        assert_eq!(tx.len(), 1);
        assert_eq!(tx.get(b.address()), Some(b));
    }

    #[test]
    fn test_unshift_first_and_once() {
        let tx = Transaction::new();
        let a = Block::new(b"a".to_vec());
        let root = Block::new(b"root".to_vec());
        tx.put(a.clone());
        tx.unshift(root.clone()).unwrap();
        let entries = tx.entries();
        assert_eq!(entries[0], root);
        assert_eq!(entries[1], a);
        assert_eq!(tx.get(root.address()), Some(root.clone()));

        let err = tx.unshift(Block::new(b"again".to_vec())).unwrap_err();
        assert!(matches!(err, StoreError::DoubleUnshift(_)));
    }

    #[test]
    fn test_unshifted_block_not_duplicated() {
        let tx = Transaction::new();
        let root = Block::new(b"root".to_vec());
        tx.put(root.clone());
        tx.unshift(root).unwrap();
        assert_eq!(tx.entries().len(), 1);
        assert_eq!(tx.len(), 1);
    }
}
