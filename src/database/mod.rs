//! Storage layer: block-index store, block-body archive, and peer lists,
//! coordinated by [`DatabaseManager`].
//!
//! Disk failures are retried with bounded exponential backoff; once the
//! bound is exhausted the manager enters degraded mode and keeps serving
//! from memory while logging the condition.

pub mod archive;
pub mod block_index;
pub mod index_map;
pub mod peers;

pub use archive::BlockArchive;
pub use block_index::{
    BlockIndex, BlockIndexStore, BLOCK_INDEX_RECORD_LEN, FLAG_MAIN_CHAIN, FLAG_VALID,
};
pub use index_map::{IndexMap, KEY_WIDTH};
pub use peers::{export_peer_addresses_csv, load_peer_addresses, save_peer_addresses};

use crate::blockchain::Block;
use crate::crypto::Hash32;
use crate::error::StorageError;
use std::path::PathBuf;
use std::time::Duration;

const RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

/// Retry a storage operation with exponential backoff up to a bound.
pub fn with_backoff<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                log::warn!("{} failed (attempt {}): {}; retrying", what, attempt, e);
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug)]
pub struct DatabaseManager {
    data_dir: PathBuf,
    pub indices: BlockIndexStore,
    pub archive: BlockArchive,
    degraded: bool,
}

impl DatabaseManager {
    /// Open (or initialize) the persistent state under `data_dir`.
    /// A corrupt index file is logged and replaced by an empty store.
    pub fn open(data_dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&data_dir)?;
        let archive = BlockArchive::open(data_dir.join("blocks"))?;

        let indices_path = data_dir.join("block_indices.dat");
        let indices = if indices_path.is_file() {
            match BlockIndexStore::load(&indices_path) {
                Ok(store) => store,
                Err(e) => {
                    log::error!("block index load failed ({}); starting empty", e);
                    BlockIndexStore::new()
                }
            }
        } else {
            BlockIndexStore::new()
        };

        Ok(DatabaseManager {
            data_dir,
            indices,
            archive,
            degraded: false,
        })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// True once a storage failure exhausted its retries; the node keeps
    /// operating from memory.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Persist a validated block body and its index entry. In degraded mode
    /// the index entry is still kept in memory.
    pub fn store_block(&mut self, block: &Block, index: BlockIndex) {
        let hash = index.hash;
        self.indices.insert(index);

        if self.degraded {
            return;
        }
        if let Err(e) = with_backoff("block archive write", || self.archive.write(&hash, block)) {
            log::error!(
                "block archive write for {} failed permanently: {}; entering degraded mode",
                hash,
                e
            );
            self.degraded = true;
        }
    }

    pub fn load_block(&self, hash: &Hash32) -> Option<Block> {
        match self.archive.read(hash) {
            Ok(block) => block,
            Err(e) => {
                log::error!("block archive read for {} failed: {}", hash, e);
                None
            }
        }
    }

    /// Flush the block indices to disk.
    pub fn save(&mut self) -> Result<(), StorageError> {
        if self.degraded {
            log::warn!("degraded mode: skipping block index save");
            return Ok(());
        }
        let path = self.data_dir.join("block_indices.dat");
        match with_backoff("block index save", || self.indices.save(&path)) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("block index save failed permanently: {}", e);
                self.degraded = true;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Block;
    use crate::network::codec::ByteReader;
    use num_bigint::BigUint;
    use num_traits::One;

    fn genesis_block() -> Block {
        let fixture = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/genesis.dat"));
        let mut r = ByteReader::new(&fixture[24..]);
        Block::parse(&mut r).unwrap()
    }

    #[test]
    fn test_store_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let block = genesis_block();
        let hash = block.header.hash();

        {
            let mut db = DatabaseManager::open(dir.path().to_path_buf()).unwrap();
            let index = BlockIndex::new(block.header, 0, &BigUint::one(), FLAG_VALID);
            db.store_block(&block, index);
            db.save().unwrap();
            assert!(!db.is_degraded());
        }

        let db = DatabaseManager::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(db.indices.len(), 1);
        assert!(db.indices.contains(&hash));
        assert_eq!(db.load_block(&hash), Some(block));
    }

    #[test]
    fn test_backoff_retries_then_succeeds() {
        let mut failures_left = 2;
        let result = with_backoff("test op", || {
            if failures_left > 0 {
                failures_left -= 1;
                Err(StorageError::Corrupt("transient"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_backoff_bounded() {
        let mut calls = 0;
        let result: Result<(), _> = with_backoff("test op", || {
            calls += 1;
            Err(StorageError::Corrupt("permanent"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_corrupt_indices_fall_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("block_indices.dat"), b"garbage").unwrap();
        let db = DatabaseManager::open(dir.path().to_path_buf()).unwrap();
        assert!(db.indices.is_empty());
    }
}
