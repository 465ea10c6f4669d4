//! # cinder-core
//!
//! Leaf types for the Cinder content-addressed document store.
//!
//! This crate provides:
//! - [`Hash`]: SHA-256 content addresses
//! - [`Block`]: immutable `(address, bytes)` pairs that always verify
//! - [`car`]: the sequential archive (CAR) container used to persist blocks
//! - [`wire`]: the serialized meta forms exchanged between peers and servers
//!
//! ## Example
//!
//! ```rust
//! use cinder_core::{Block, car::{CarReader, CarWriter}};
//!
//! let block = Block::new(b"hello".to_vec());
//! let mut writer = CarWriter::new(vec![*block.address()]);
//! writer.write(block.address(), block.bytes()).unwrap();
//! let bytes = writer.finish();
//!
//! let reader = CarReader::new(&bytes).unwrap();
//! assert_eq!(reader.roots(), &[*block.address()]);
//! ```

mod block;
pub mod car;
mod error;
mod hash;
pub mod wire;

pub use block::Block;
pub use error::{CoreError, Result};
pub use hash::{Hash, Hasher};
