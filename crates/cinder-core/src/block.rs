//! Immutable content-addressed blocks.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CoreError, Result};
use crate::hash::{Hash, Hasher};

/// An immutable `(address, bytes)` pair.
///
/// A `Block` can only be built from bytes (which computes the address) or
/// from a claimed address that is checked against the bytes, so a value of
/// this type always verifies.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    address: Hash,
    bytes: Bytes,
}

impl Block {
    /// Create a block, computing its address.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let address = Hasher::hash(&bytes);
        Block { address, bytes }
    }

    /// Rebuild a block read back from storage, rejecting it if the bytes
    /// do not hash to the claimed address.
    pub fn from_parts(address: Hash, bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let actual = Hasher::hash(&bytes);
        if actual != address {
            return Err(CoreError::AddressMismatch {
                expected: address,
                actual,
            });
        }
        Ok(Block { address, bytes })
    }

    /// Encode a value as JSON and wrap it in a block.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Block::new(serde_json::to_vec(value)?))
    }

    /// Decode the block payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    pub fn address(&self) -> &Hash {
        &self.address
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("address", &self.address)
            .field("len", &self.bytes.len())
            .finish()
    }
}
