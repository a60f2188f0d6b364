//! Built-in self-tests behind the `test` CLI command: quick end-to-end
//! checks against known protocol fixtures, runnable on any install.

use crate::blockchain::Block;
use crate::config::NetworkType;
use crate::crypto::{merkle_root, sharipe, Hash32};
use crate::network::codec::{var_int_width, ByteReader, ByteWriter};
use crate::network::message::{payload_checksum, BlockLocatorPayload, Message};

const GENESIS_MESSAGE: &[u8] =
    include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/genesis.dat"));
const GETHEADERS_MESSAGE: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/fixtures/getheaders_initial.dat"
));

const GENESIS_HASH_HEX: &str = "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000";

fn check(name: &str, ok: bool, failures: &mut Vec<String>) {
    if ok {
        log::info!("self-test {}: ok", name);
    } else {
        log::error!("self-test {}: FAILED", name);
        failures.push(name.to_string());
    }
}

fn genesis_block() -> Result<Block, String> {
    let mut r = ByteReader::new(&GENESIS_MESSAGE[24..]);
    Block::parse(&mut r).map_err(|e| format!("genesis fixture unparsable: {}", e))
}

/// Run every check; returns the list of failures.
pub fn run() -> Result<(), Vec<String>> {
    let mut failures = Vec::new();

    let block = match genesis_block() {
        Ok(block) => block,
        Err(e) => return Err(vec![e]),
    };

    check(
        "genesis header hash",
        block.header.hash().to_string() == GENESIS_HASH_HEX,
        &mut failures,
    );

    check(
        "genesis merkle root",
        merkle_root(&block.txids()).ok() == Some(block.header.merkle_root),
        &mut failures,
    );

    // The 69-byte handshake-era payload with a known checksum.
    let mut payload = vec![0x7f, 0x11, 0x01, 0x00, 0x01];
    payload.extend_from_slice(block.header.hash().as_bytes());
    payload.extend_from_slice(&[0u8; 32]);
    check(
        "payload checksum",
        payload_checksum(&payload) == [0x84, 0xF4, 0x95, 0x8D],
        &mut failures,
    );

    check(
        "sharipe(\"hello\")",
        hex::encode(sharipe(b"hello")) == "b6a9c8c230722b7c748331a8b450f05566dc7d0f",
        &mut failures,
    );

    let getheaders = Message::GetHeaders(BlockLocatorPayload {
        version: 70015,
        locator_hashes: vec![block.header.hash()],
        hash_stop: Hash32::zero(),
    });
    check(
        "getheaders reference bytes",
        getheaders
            .to_bytes(NetworkType::Mainnet.magic_bytes())
            .map(|bytes| bytes == GETHEADERS_MESSAGE)
            .unwrap_or(false),
        &mut failures,
    );

    let varint_ok = [
        (0u64, 1u8),
        (0xFC, 1),
        (0xFD, 3),
        (0xFFFF, 3),
        (0x10000, 5),
        (0x1_0000_0000, 9),
    ]
    .iter()
    .all(|&(value, width)| {
        let mut w = ByteWriter::new();
        w.put_var_int(value) == width && w.len() == width as usize && var_int_width(value) == width
    });
    check("varint widths", varint_ok, &mut failures);

    let mut map = crate::database::IndexMap::with_capacity(8);
    let mut probe_ok = true;
    for i in 0..4096u32 {
        let mut key = [0u8; 32];
        key[..4].copy_from_slice(&i.to_le_bytes());
        map.insert(key, i);
    }
    for i in 0..4096u32 {
        let mut key = [0u8; 32];
        key[..4].copy_from_slice(&i.to_le_bytes());
        probe_ok &= map.get(&key) == Some(&i);
    }
    check("index map", probe_ok, &mut failures);

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}
