//! Chain data structures: transactions and blocks in wire form.

pub mod block;
pub mod tx;

pub use block::{Block, BlockHeader, BLOCK_HEADER_LEN};
pub use tx::{OutPoint, Transaction, TxIn, TxOut, TxWitness, COINBASE_INDEX};
