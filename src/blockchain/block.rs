//! Block and block-header wire format.

use crate::blockchain::tx::Transaction;
use crate::crypto::{dsha256, Hash32};
use crate::error::ParseError;
use crate::network::codec::{ByteReader, ByteWriter};

pub const BLOCK_HEADER_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u32,
    /// Difficulty threshold in compact form.
    pub target: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(BlockHeader {
            version: r.read_i32_le()?,
            prev_block: r.read_hash()?,
            merkle_root: r.read_hash()?,
            timestamp: r.read_u32_le()?,
            target: r.read_u32_le()?,
            nonce: r.read_u32_le()?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_i32_le(self.version);
        w.put_hash(&self.prev_block);
        w.put_hash(&self.merkle_root);
        w.put_u32_le(self.timestamp);
        w.put_u32_le(self.target);
        w.put_u32_le(self.nonce);
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut w = ByteWriter::new();
        self.serialize(&mut w);
        w.into_bytes().try_into().expect("header is 80 bytes")
    }

    /// Double SHA-256 of the 80 serialized bytes; the block's identity.
    pub fn hash(&self) -> Hash32 {
        dsha256(&self.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        let header = BlockHeader::parse(r)?;
        let tx_count = r.read_var_int()?;
        let mut txs = Vec::new();
        for _ in 0..tx_count {
            txs.push(Transaction::parse(r)?);
        }
        Ok(Block { header, txs })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        self.header.serialize(w);
        w.put_var_int(self.txs.len() as u64);
        for tx in &self.txs {
            tx.serialize(w);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.serialize(&mut w);
        w.into_bytes()
    }

    pub fn txids(&self) -> Vec<Hash32> {
        self.txs.iter().map(|tx| tx.txid()).collect()
    }
}
