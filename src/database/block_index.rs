//! Compact per-block metadata and its hash-keyed store.
//!
//! Persistence format (`block_indices.dat`): a `u32` record count followed
//! by that many fixed-size records. A parallel `prev_block -> hash` map
//! accelerates forward traversal; it is never persisted, always rebuilt
//! from the primary on load.

use crate::blockchain::{BlockHeader, BLOCK_HEADER_LEN};
use crate::crypto::{Hash32, HASH_LEN};
use crate::database::index_map::IndexMap;
use crate::error::{ParseError, StorageError};
use crate::network::codec::{ByteReader, ByteWriter};
use num_bigint::BigUint;
use std::fs;
use std::path::Path;

/// hash + header + height + total_work + context_flags.
pub const BLOCK_INDEX_RECORD_LEN: usize = HASH_LEN + BLOCK_HEADER_LEN + 4 + 32 + 1;

/// The block passed full validation.
pub const FLAG_VALID: u8 = 0x01;
/// The block lies on the current best chain.
pub const FLAG_MAIN_CHAIN: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndex {
    pub hash: Hash32,
    pub header: BlockHeader,
    pub height: u32,
    /// Cumulative chain work, 256-bit little-endian at rest.
    pub total_work: [u8; 32],
    pub context_flags: u8,
}

impl BlockIndex {
    pub fn new(header: BlockHeader, height: u32, total_work: &BigUint, context_flags: u8) -> Self {
        let mut work = [0u8; 32];
        let le = total_work.to_bytes_le();
        work[..le.len()].copy_from_slice(&le);
        BlockIndex {
            hash: header.hash(),
            header,
            height,
            total_work: work,
            context_flags,
        }
    }

    pub fn total_work_value(&self) -> BigUint {
        BigUint::from_bytes_le(&self.total_work)
    }

    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(BlockIndex {
            hash: r.read_hash()?,
            header: BlockHeader::parse(r)?,
            height: r.read_u32_le()?,
            total_work: r.read(32)?.try_into().unwrap(),
            context_flags: r.read_u8()?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_hash(&self.hash);
        self.header.serialize(w);
        w.put_u32_le(self.height);
        w.put(&self.total_work);
        w.put_u8(self.context_flags);
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockIndexStore {
    primary: IndexMap<BlockIndex>,
    /// prev_block hash -> child hash, for walking the chain forward.
    forward: IndexMap<Hash32>,
}

impl BlockIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn insert(&mut self, index: BlockIndex) {
        self.forward
            .insert(index.header.prev_block.into_bytes(), index.hash);
        self.primary.insert(index.hash.into_bytes(), index);
    }

    pub fn get(&self, hash: &Hash32) -> Option<&BlockIndex> {
        self.primary.get(hash.as_bytes())
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.primary.contains_key(hash.as_bytes())
    }

    /// The block that builds on `hash`, if one is indexed.
    pub fn next_of(&self, hash: &Hash32) -> Option<&Hash32> {
        self.forward.get(hash.as_bytes())
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockIndex> {
        self.primary.iter().map(|(_, index)| index)
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let mut w = ByteWriter::new();
        w.put_u32_le(self.primary.len() as u32);
        for index in self.iter() {
            index.serialize(&mut w);
        }
        fs::write(path, w.into_bytes())?;
        log::info!("saved {} block indices to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let bytes = fs::read(path)?;
        let mut r = ByteReader::new(&bytes);
        let count = r
            .read_u32_le()
            .map_err(|_| StorageError::Corrupt("block index count"))?;
        if bytes.len() != 4 + count as usize * BLOCK_INDEX_RECORD_LEN {
            return Err(StorageError::Corrupt("block index file length"));
        }

        let mut store = BlockIndexStore::new();
        for _ in 0..count {
            let index =
                BlockIndex::parse(&mut r).map_err(|_| StorageError::Corrupt("block index record"))?;
            // Key invariant: the stored hash must match the header.
            if index.header.hash() != index.hash {
                return Err(StorageError::Corrupt("block index hash mismatch"));
            }
            store.insert(index);
        }
        log::info!("loaded {} block indices from {}", store.len(), path.display());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::dsha256;
    use num_traits::One;

    fn header_chain(length: u32) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut prev = Hash32::zero();
        for i in 0..length {
            let header = BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: dsha256(&i.to_le_bytes()),
                timestamp: 1_300_000_000 + i,
                target: 0x207F_FFFF,
                nonce: i,
            };
            prev = header.hash();
            headers.push(header);
        }
        headers
    }

    #[test]
    fn test_record_len_constant() {
        let index = BlockIndex::new(header_chain(1)[0], 0, &BigUint::one(), FLAG_VALID);
        let mut w = ByteWriter::new();
        index.serialize(&mut w);
        assert_eq!(w.len(), BLOCK_INDEX_RECORD_LEN);
    }

    #[test]
    fn test_insert_get_and_forward_map() {
        let headers = header_chain(3);
        let mut store = BlockIndexStore::new();
        for (height, header) in headers.iter().enumerate() {
            store.insert(BlockIndex::new(
                *header,
                height as u32,
                &BigUint::one(),
                FLAG_VALID,
            ));
        }

        let first = headers[0].hash();
        assert!(store.contains(&first));
        assert_eq!(store.get(&first).unwrap().height, 0);

        // Forward traversal from genesis predecessor to the tip.
        let mut cursor = Hash32::zero();
        let mut walked = 0;
        while let Some(next) = store.next_of(&cursor) {
            cursor = *next;
            walked += 1;
        }
        assert_eq!(walked, 3);
        assert_eq!(cursor, headers[2].hash());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block_indices.dat");

        let headers = header_chain(5);
        let mut store = BlockIndexStore::new();
        let mut work = BigUint::one();
        for (height, header) in headers.iter().enumerate() {
            work += 1u32;
            store.insert(BlockIndex::new(
                *header,
                height as u32,
                &work,
                FLAG_VALID | FLAG_MAIN_CHAIN,
            ));
        }
        store.save(&path).unwrap();

        let loaded = BlockIndexStore::load(&path).unwrap();
        assert_eq!(loaded.len(), store.len());
        for header in &headers {
            let hash = header.hash();
            assert_eq!(loaded.get(&hash), store.get(&hash));
        }
        // Forward map was rebuilt.
        assert_eq!(
            loaded.next_of(&headers[0].hash()),
            Some(&headers[1].hash())
        );
    }

    #[test]
    fn test_corrupt_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block_indices.dat");

        let mut store = BlockIndexStore::new();
        store.insert(BlockIndex::new(
            header_chain(1)[0],
            0,
            &BigUint::one(),
            FLAG_VALID,
        ));
        store.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 1);
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            BlockIndexStore::load(&path),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_total_work_roundtrip() {
        let work = BigUint::from(0xDEAD_BEEFu64) << 128;
        let index = BlockIndex::new(header_chain(1)[0], 9, &work, 0);
        assert_eq!(index.total_work_value(), work);
    }
}
