//! Consensus rules: target arithmetic, block validation, and mining.

pub mod pow;
pub mod target;
pub mod validate;

pub use pow::{mine, mine_parallel};
pub use target::{
    block_work, compress_target, expand_compact, hash_satisfies_target,
    hash_satisfies_target_compact, next_compact_target, POW_LIMIT_COMPACT,
};
pub use validate::{
    check_block, check_header, check_transaction, BlockContext, InvalidBlock, TxContext, TxError,
};
