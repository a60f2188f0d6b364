//! On-disk block bodies, one file per block under a content-addressed path:
//! `blocks/XX/YYYY…` where `XX` is the first hash byte in hex.
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place. Concurrent writes for the same hash collapse to one through a
//! per-hash in-flight set.

use crate::blockchain::Block;
use crate::crypto::Hash32;
use crate::error::StorageError;
use crate::network::codec::ByteReader;
use rand::Rng;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub struct BlockArchive {
    root: PathBuf,
    in_flight: Mutex<HashSet<Hash32>>,
}

impl BlockArchive {
    pub fn open(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root)?;
        Ok(BlockArchive {
            root,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn path_for(&self, hash: &Hash32) -> PathBuf {
        let hex = hash.to_string();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.path_for(hash).is_file()
    }

    /// Persist one block body. Returns false when the body already exists
    /// or another write for the same hash is in flight.
    pub fn write(&self, hash: &Hash32, block: &Block) -> Result<bool, StorageError> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(*hash) {
                return Ok(false);
            }
        }
        let result = self.write_locked(hash, block);
        self.in_flight.lock().unwrap().remove(hash);
        result
    }

    fn write_locked(&self, hash: &Hash32, block: &Block) -> Result<bool, StorageError> {
        let path = self.path_for(hash);
        if path.is_file() {
            return Ok(false);
        }
        let dir = path.parent().expect("archive paths have a parent");
        fs::create_dir_all(dir)?;

        let suffix: u32 = rand::thread_rng().gen();
        let tmp = dir.join(format!(".tmp-{:08x}", suffix));
        fs::write(&tmp, block.to_bytes())?;
        fs::rename(&tmp, &path)?;
        log::debug!("archived block {}", hash);
        Ok(true)
    }

    pub fn read(&self, hash: &Hash32) -> Result<Option<Block>, StorageError> {
        let path = self.path_for(hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut r = ByteReader::new(&bytes);
        let block = Block::parse(&mut r).map_err(|_| StorageError::Corrupt("block body"))?;
        // The body's header hash is the store key.
        if block.header.hash() != *hash {
            return Err(StorageError::Corrupt("block body hash mismatch"));
        }
        Ok(Some(block))
    }

    pub fn remove(&self, hash: &Hash32) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
