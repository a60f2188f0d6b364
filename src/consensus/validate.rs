//! Block and transaction legality.
//!
//! Script execution and previous-output lookup are external concerns,
//! reached through the [`TxContext`] trait; everything else is enforced
//! here.

use crate::blockchain::{Block, BlockHeader, Transaction, TxOut};
use crate::config::ChainParams;
use crate::consensus::target::hash_satisfies_target_compact;
use crate::crypto::merkle_root;
use thiserror::Error;

/// Lock times below this are block heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

pub const ACCEPTED_TX_VERSIONS: &[i32] = &[1, 2];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    #[error("version not in accepted set")]
    UnknownVersion,

    #[error("lock time not final for this block")]
    NonFinal,

    #[error("referenced previous output does not exist or is spent")]
    MissingInput,

    #[error("script execution did not leave a truthy stack top")]
    ScriptRejected,

    #[error("output total exceeds input total")]
    OutputsExceedInputs,

    #[error("coinbase script length out of bounds")]
    CoinbaseScriptSize,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidBlock {
    #[error("no transactions")]
    Empty,

    #[error("timestamp too far in the future")]
    TimestampTooFar,

    #[error("first transaction does not start with a coinbase input")]
    NoCoinbase,

    #[error("more than one coinbase input")]
    MultipleCoinbase,

    #[error("merkle root does not match transactions")]
    BadMerkle,

    #[error("header hash above target")]
    HashAboveTarget,

    #[error("previous block not known")]
    UnknownPrevBlock,

    #[error("transaction {index} illegal: {reason}")]
    BadTx { index: usize, reason: TxError },
}

/// Seam to the script interpreter and the unspent-output view.
pub trait TxContext {
    /// The referenced output, if it exists and is unspent.
    fn lookup_unspent(&self, outpoint: &crate::blockchain::OutPoint) -> Option<TxOut>;

    /// Execute `signature_script` then `pk_script`; true iff the stack top
    /// is truthy afterwards.
    fn verify_script(
        &self,
        signature_script: &[u8],
        pk_script: &[u8],
        tx: &Transaction,
        input_index: usize,
    ) -> bool;
}

/// Block-level inputs to validation that come from chain context.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub now: i64,
    pub height: u32,
    pub prev_known: bool,
}

/// Header legality: forward-timestamp bound, proof of work, known parent.
pub fn check_header(
    header: &BlockHeader,
    ctx: &BlockContext,
    params: &ChainParams,
) -> Result<(), InvalidBlock> {
    if header.timestamp as i64 - ctx.now >= params.block_max_forward_timestamp as i64 {
        return Err(InvalidBlock::TimestampTooFar);
    }
    if !hash_satisfies_target_compact(&header.hash(), header.target) {
        return Err(InvalidBlock::HashAboveTarget);
    }
    if !header.prev_block.is_zero() && !ctx.prev_known {
        return Err(InvalidBlock::UnknownPrevBlock);
    }
    Ok(())
}

/// Whether a lock time is satisfied in the block being validated.
fn is_final(tx: &Transaction, height: u32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        block_time
    };
    if tx.lock_time < cutoff {
        return true;
    }
    // Maxed-out sequences opt every input out of lock-time semantics.
    tx.inputs.iter().all(|input| input.sequence == u32::MAX)
}

/// Transaction legality per the script-interpreter contract.
pub fn check_transaction(
    tx: &Transaction,
    is_coinbase_tx: bool,
    height: u32,
    block_time: u32,
    params: &ChainParams,
    ctx: &dyn TxContext,
) -> Result<(), TxError> {
    if !ACCEPTED_TX_VERSIONS.contains(&tx.version) {
        return Err(TxError::UnknownVersion);
    }
    if !is_final(tx, height, block_time) {
        return Err(TxError::NonFinal);
    }

    if is_coinbase_tx {
        let script_len = tx.inputs.first().map(|i| i.signature_script.len()).unwrap_or(0);
        if script_len < params.script_sig_size_lower || script_len > params.script_sig_size_upper {
            return Err(TxError::CoinbaseScriptSize);
        }
        return Ok(());
    }

    let mut input_total: i128 = 0;
    for (index, input) in tx.inputs.iter().enumerate() {
        let previous = ctx
            .lookup_unspent(&input.previous_output)
            .ok_or(TxError::MissingInput)?;
        if !ctx.verify_script(&input.signature_script, &previous.pk_script, tx, index) {
            return Err(TxError::ScriptRejected);
        }
        input_total += previous.value as i128;
    }

    let output_total: i128 = tx.outputs.iter().map(|o| o.value as i128).sum();
    if output_total > input_total {
        return Err(TxError::OutputsExceedInputs);
    }

    Ok(())
}

/// Full block legality on top of header legality.
pub fn check_block(
    block: &Block,
    ctx: &BlockContext,
    params: &ChainParams,
    tx_ctx: &dyn TxContext,
) -> Result<(), InvalidBlock> {
    if block.txs.is_empty() {
        return Err(InvalidBlock::Empty);
    }

    check_header(&block.header, ctx, params)?;

    let first_is_coinbase = block.txs[0]
        .inputs
        .first()
        .map(|input| input.is_coinbase())
        .unwrap_or(false);
    if !first_is_coinbase {
        return Err(InvalidBlock::NoCoinbase);
    }

    for (tx_index, tx) in block.txs.iter().enumerate() {
        for (input_index, input) in tx.inputs.iter().enumerate() {
            if tx_index == 0 && input_index == 0 {
                continue;
            }
            if input.is_coinbase() {
                return Err(InvalidBlock::MultipleCoinbase);
            }
        }
    }

    for (index, tx) in block.txs.iter().enumerate() {
        check_transaction(
            tx,
            index == 0,
            ctx.height,
            block.header.timestamp,
            params,
            tx_ctx,
        )
        .map_err(|reason| InvalidBlock::BadTx { index, reason })?;
    }

    let computed = merkle_root(&block.txids()).map_err(|_| InvalidBlock::Empty)?;
    if computed != block.header.merkle_root {
        return Err(InvalidBlock::BadMerkle);
    }

    Ok(())
}
