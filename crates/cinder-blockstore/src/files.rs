//! Chunked file payloads.
//!
//! A file is split into fixed-size chunk blocks and described by a
//! [`FileIndex`] block, so a byte range can be read by fetching only the
//! chunks that cover it.

use bytes::Bytes;
use cinder_core::{Block, Hash};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Index block of a chunked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndex {
    pub size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<Hash>,
}

impl FileIndex {
    /// Indices of the chunks covering `offset..offset + len`, clamped to the
    /// file size.
    pub fn chunk_range(&self, offset: u64, len: u64) -> std::ops::Range<usize> {
        if self.chunk_size == 0 || offset >= self.size || len == 0 {
            return 0..0;
        }
        let end = offset.saturating_add(len).min(self.size);
        let first = (offset / self.chunk_size) as usize;
        let last = ((end - 1) / self.chunk_size) as usize;
        first..last + 1
    }
}

/// Reference to a stored file, kept by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Archives holding the file's blocks.
    pub cars: Vec<Hash>,
    /// Address of the [`FileIndex`] block.
    pub index: Hash,
    pub size: u64,
}

/// Split `data` into chunk blocks followed by their index block.
pub fn chunk_file(data: &[u8], chunk_size: usize) -> Result<(Block, Vec<Block>)> {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Block> = data
        .chunks(chunk_size)
        .map(|c| Block::new(Bytes::copy_from_slice(c)))
        .collect();
    let index = FileIndex {
        size: data.len() as u64,
        chunk_size: chunk_size as u64,
        chunks: chunks.iter().map(|b| *b.address()).collect(),
    };
    Ok((Block::encode(&index)?, chunks))
}

/// Slice the bytes of `offset..offset + len` out of the covering chunks.
pub fn assemble_range(index: &FileIndex, chunks: &[Bytes], offset: u64, len: u64) -> Vec<u8> {
    let range = index.chunk_range(offset, len);
    if range.is_empty() {
        return Vec::new();
    }
    let end = offset.saturating_add(len).min(index.size);
    let base = range.start as u64 * index.chunk_size;
    let mut joined = Vec::new();
    for chunk in chunks {
        joined.extend_from_slice(chunk);
    }
    let from = (offset - base) as usize;
    let to = ((end - base) as usize).min(joined.len());
    joined[from.min(to)..to].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_and_index() {
        let data: Vec<u8> = (0..100u8).collect();
        let (index_block, chunks) = chunk_file(&data, 30).unwrap();
        let index: FileIndex = index_block.decode().unwrap();
        assert_eq!(index.size, 100);
        assert_eq!(chunks.len(), 4);
        assert_eq!(index.chunks.len(), 4);
    }

    #[test]
    fn test_chunk_range() {
        let index = FileIndex {
            size: 100,
            chunk_size: 30,
            chunks: vec![],
        };
        assert_eq!(index.chunk_range(0, 10), 0..1);
        assert_eq!(index.chunk_range(25, 10), 0..2);
        assert_eq!(index.chunk_range(90, 50), 3..4);
        assert_eq!(index.chunk_range(100, 5), 0..0);
    }

    #[test]
    fn test_assemble_range() {
        let data: Vec<u8> = (0..100u8).collect();
        let (index_block, chunks) = chunk_file(&data, 30).unwrap();
        let index: FileIndex = index_block.decode().unwrap();
        let range = index.chunk_range(25, 40);
        let covering: Vec<Bytes> = chunks[range].iter().map(|b| b.bytes().clone()).collect();
        assert_eq!(assemble_range(&index, &covering, 25, 40), data[25..65].to_vec());
    }

    #[test]
    fn test_read_to_end_with_open_length() {
        let data: Vec<u8> = (0..100u8).collect();
        let (index_block, chunks) = chunk_file(&data, 30).unwrap();
        let index: FileIndex = index_block.decode().unwrap();
        let range = index.chunk_range(2, u64::MAX);
        assert_eq!(range, 0..4);
        let covering: Vec<Bytes> = chunks[range].iter().map(|b| b.bytes().clone()).collect();
        assert_eq!(assemble_range(&index, &covering, 2, u64::MAX), data[2..].to_vec());
    }
}
