//! Nonce search over a block header.

use crate::blockchain::BlockHeader;
use crate::consensus::target::{expand_compact, hash_satisfies_target};
use crate::crypto::dsha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

/// Scan `nonce ∈ [start_nonce, u32::MAX)` and return the first nonce whose
/// header hash satisfies the header's own compact target.
pub fn mine(header: &BlockHeader, start_nonce: u32) -> Option<u32> {
    mine_range(header, start_nonce, u32::MAX, &AtomicBool::new(false))
}

fn mine_range(
    header: &BlockHeader,
    start_nonce: u32,
    end_nonce: u32,
    stop: &AtomicBool,
) -> Option<u32> {
    let target = expand_compact(header.target);
    let mut bytes = header.to_bytes();

    for nonce in start_nonce..end_nonce {
        bytes[76..80].copy_from_slice(&nonce.to_le_bytes());
        if hash_satisfies_target(&dsha256(&bytes), &target) {
            return Some(nonce);
        }
        // Check the shared flag rarely; the hash dominates anyway.
        if nonce % (1 << 16) == 0 && stop.load(Ordering::Relaxed) {
            return None;
        }
    }
    None
}

/// Partition the nonce space into disjoint ranges, one worker thread each.
/// The first worker to find a solution stops the rest.
pub fn mine_parallel(header: &BlockHeader, workers: usize) -> Option<u32> {
    let workers = workers.max(1) as u32;
    let stride = u32::MAX / workers;
    let stop = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel();

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let start = worker * stride;
            let end = if worker == workers - 1 {
                u32::MAX
            } else {
                start + stride
            };
            let tx = tx.clone();
            let stop = &stop;
            scope.spawn(move || {
                let found = mine_range(header, start, end, stop);
                if found.is_some() {
                    stop.store(true, Ordering::Relaxed);
                }
                let _ = tx.send(found);
            });
        }
        drop(tx);

        let mut best: Option<u32> = None;
        for found in rx {
            if let Some(nonce) = found {
                best = Some(best.map_or(nonce, |b| b.min(nonce)));
                stop.store(true, Ordering::Relaxed);
            }
        }
        best
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{dsha256, Hash32};

    fn easy_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: Hash32::zero(),
            merkle_root: dsha256(b"coinbase"),
            timestamp: 1_300_000_000,
            // Regtest-grade target: roughly one in two hashes qualifies.
            target: 0x207F_FFFF,
            nonce: 0,
        }
    }

    #[test]
    fn test_mine_finds_satisfying_nonce() {
        let mut header = easy_header();
        let nonce = mine(&header, 0).expect("easy target");
        header.nonce = nonce;
        assert!(crate::consensus::target::hash_satisfies_target_compact(
            &header.hash(),
            header.target
        ));
    }

    #[test]
    fn test_mine_respects_start_nonce() {
        let header = easy_header();
        let nonce = mine(&header, 1000).unwrap();
        assert!(nonce >= 1000);
    }

    #[test]
    fn test_mine_parallel_agrees_with_target() {
        let mut header = easy_header();
        let nonce = mine_parallel(&header, 4).expect("easy target");
        header.nonce = nonce;
        assert!(crate::consensus::target::hash_satisfies_target_compact(
            &header.hash(),
            header.target
        ));
    }

    #[test]
    fn test_impossible_range_returns_none() {
        // Zero target: no hash can qualify within a short scan window.
        let mut header = easy_header();
        header.target = 0;
        assert_eq!(
            mine_range(&header, 0, 2_000, &AtomicBool::new(false)),
            None
        );
    }
}
