//! Sequential archive (CAR) container.
//!
//! Layout: a varint length-prefixed JSON header `{ "version": 1, "roots": [..] }`
//! followed by varint length-prefixed sections, each holding a 32-byte address
//! and the entry payload. The archive can be read front to back without an
//! index.
//!
//! Entry payloads are stored as given. When the store encrypts, the payload
//! is the sealed envelope and the address is that of the plaintext block, so
//! archive readers do not verify entries themselves.

use bytes::Bytes;
use integer_encoding::VarInt;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::hash::{Hash, Hasher};

/// Maximum size accepted for a single length-delimited section.
pub const MAX_ALLOC: usize = 4 * 1024 * 1024;

const ADDRESS_LEN: usize = 32;

/// Archive header, version 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeader {
    pub version: u64,
    pub roots: Vec<Hash>,
}

impl CarHeader {
    pub fn new(roots: Vec<Hash>) -> Self {
        CarHeader { version: 1, roots }
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let header: CarHeader =
            serde_json::from_slice(buffer).map_err(|e| CoreError::Parsing(e.to_string()))?;

        if header.roots.is_empty() {
            return Err(CoreError::Parsing("empty CAR file".to_owned()));
        }
        if header.version != 1 {
            return Err(CoreError::InvalidFile(
                "Only CAR file version 1 is supported".to_string(),
            ));
        }
        Ok(header)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Number of bytes an entry occupies in an archive.
pub fn entry_len(payload_len: usize) -> usize {
    let section = ADDRESS_LEN + payload_len;
    section.required_space() + section
}

/// Builds an archive in memory.
pub struct CarWriter {
    header: CarHeader,
    buf: Vec<u8>,
}

impl CarWriter {
    pub fn new(roots: Vec<Hash>) -> Self {
        CarWriter {
            header: CarHeader::new(roots),
            buf: Vec::new(),
        }
    }

    /// Append one entry. Entries the reader would refuse are rejected here.
    pub fn write(&mut self, address: &Hash, payload: &[u8]) -> Result<()> {
        let len = ADDRESS_LEN + payload.len();
        if len > MAX_ALLOC {
            return Err(CoreError::EntryTooLarge {
                address: *address,
                len,
            });
        }
        self.buf.extend_from_slice(&len.encode_var_vec());
        self.buf.extend_from_slice(address.as_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Bytes written so far, excluding the header.
    pub fn body_len(&self) -> usize {
        self.buf.len()
    }

    /// Finish the archive, returning its bytes.
    pub fn finish(self) -> Bytes {
        // header encoding of a Vec<Hash> cannot fail
        let header = serde_json::to_vec(&self.header).unwrap_or_default();
        let mut out = Vec::with_capacity(header.len() + 10 + self.buf.len());
        out.extend_from_slice(&header.len().encode_var_vec());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.buf);
        Bytes::from(out)
    }
}

fn ld_read(data: &[u8], pos: &mut usize) -> Result<Option<std::ops::Range<usize>>> {
    if *pos >= data.len() {
        return Ok(None);
    }
    let (length, used) = usize::decode_var(&data[*pos..])
        .ok_or_else(|| CoreError::Parsing("truncated length prefix".to_string()))?;
    if length > MAX_ALLOC {
        return Err(CoreError::LdReadTooLarge(length));
    }
    let start = *pos + used;
    let end = start + length;
    if end > data.len() {
        return Err(CoreError::Parsing(format!(
            "section of {} bytes exceeds archive",
            length
        )));
    }
    *pos = end;
    Ok(Some(start..end))
}

/// A parsed archive. Entry payloads share the archive's buffer.
#[derive(Debug, Clone)]
pub struct CarReader {
    address: Hash,
    header: CarHeader,
    entries: Vec<(Hash, Bytes)>,
}

impl CarReader {
    pub fn new(data: &Bytes) -> Result<Self> {
        let address = Hasher::hash(data);
        let mut pos = 0;
        let header_range = ld_read(data, &mut pos)?
            .ok_or_else(|| CoreError::InvalidFile("missing header".to_string()))?;
        let header = CarHeader::decode(&data[header_range])?;

        let mut entries = Vec::new();
        while let Some(range) = ld_read(data, &mut pos)? {
            if range.len() < ADDRESS_LEN {
                return Err(CoreError::Parsing("section shorter than address".into()));
            }
            let mut addr = [0u8; ADDRESS_LEN];
            addr.copy_from_slice(&data[range.start..range.start + ADDRESS_LEN]);
            entries.push((
                Hash::from_bytes(addr),
                data.slice(range.start + ADDRESS_LEN..range.end),
            ));
        }
        Ok(CarReader {
            address,
            header,
            entries,
        })
    }

    /// Address of the whole archive.
    pub fn address(&self) -> &Hash {
        &self.address
    }

    pub fn roots(&self) -> &[Hash] {
        &self.header.roots
    }

    pub fn entries(&self) -> &[(Hash, Bytes)] {
        &self.entries
    }

    pub fn get(&self, address: &Hash) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, b)| b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Block;

    #[test]
    fn test_write_then_read() {
        let a = Block::new(b"alpha".to_vec());
        let b = Block::new(b"beta".to_vec());
        let mut writer = CarWriter::new(vec![*a.address()]);
        writer.write(a.address(), a.bytes()).unwrap();
        writer.write(b.address(), b.bytes()).unwrap();
        let body = writer.body_len();
        assert_eq!(body, entry_len(a.len()) + entry_len(b.len()));

        let bytes = writer.finish();
        let reader = CarReader::new(&bytes).unwrap();
        assert_eq!(reader.roots(), &[*a.address()]);
        assert_eq!(reader.entries().len(), 2);
        assert_eq!(reader.get(b.address()).unwrap().as_ref(), b"beta");
        assert_eq!(*reader.address(), Hasher::hash(&bytes));
    }

    #[test]
    fn test_rejects_empty_roots() {
        let bytes = CarWriter::new(vec![]).finish();
        assert!(matches!(
            CarReader::new(&bytes),
            Err(CoreError::Parsing(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_section() {
        let root = Hasher::hash(b"root");
        let mut bytes = CarWriter::new(vec![root]).finish().to_vec();
        bytes.extend_from_slice(&(MAX_ALLOC + 1).encode_var_vec());
        let err = CarReader::new(&Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, CoreError::LdReadTooLarge(_)));
    }

    #[test]
    fn test_writer_refuses_entry_reader_would_reject() {
        let big = Block::new(vec![7u8; MAX_ALLOC]);
        let mut writer = CarWriter::new(vec![*big.address()]);
        let err = writer.write(big.address(), big.bytes()).unwrap_err();
        assert!(matches!(err, CoreError::EntryTooLarge { address, .. } if address == *big.address()));
        assert_eq!(writer.body_len(), 0);

        let fits = Block::new(vec![7u8; MAX_ALLOC - ADDRESS_LEN]);
        writer.write(fits.address(), fits.bytes()).unwrap();
        let bytes = writer.finish();
        assert!(CarReader::new(&bytes).is_ok());
    }

    #[test]
    fn test_rejects_truncated_archive() {
        let a = Block::new(b"payload".to_vec());
        let mut writer = CarWriter::new(vec![*a.address()]);
        writer.write(a.address(), a.bytes()).unwrap();
        let bytes = writer.finish();
        let cut = bytes.slice(..bytes.len() - 3);
        assert!(CarReader::new(&cut).is_err());
    }

    #[test]
    fn test_rejects_wrong_version() {
        let header = br#"{"version":2,"roots":["0000000000000000000000000000000000000000000000000000000000000000"]}"#;
        assert!(matches!(
            CarHeader::decode(header),
            Err(CoreError::InvalidFile(_))
        ));
    }
}
