//! Per-peer connection state machine.
//!
//! The machine is pure: it consumes parsed messages and returns outputs
//! (messages to send, events for the node) without touching sockets or
//! stores. The node applies the outputs and owns all shared state, reached
//! here only through the read-only [`NodeView`] seam.

use crate::blockchain::{Block, BlockHeader};
use crate::config::Config;
use crate::crypto::Hash32;
use crate::error::NodeError;
use crate::network::message::{
    AddressRecord, InventoryVector, Message, NetworkAddress, VersionPayload, INV_BLOCK, INV_TX,
    MAX_ADDR_ENTRIES, MAX_HEADERS_ENTRIES,
};
use rand::Rng;
use std::time::SystemTime;

/// Cap on inv entries when answering `getblocks`.
const MAX_GETBLOCKS_REPLY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    SentVersion,
    HalfDone,
    Ready,
    Closed,
}

/// Read-only view of node state the handlers need.
pub trait NodeView {
    fn has_block(&self, hash: &Hash32) -> bool;
    fn has_tx(&self, hash: &Hash32) -> bool;
    fn fetch_block(&self, hash: &Hash32) -> Option<Block>;
    fn addr_snapshot(&self, max: usize) -> Vec<AddressRecord>;
    /// Headers extending the best-known locator entry, oldest first.
    fn headers_after(&self, locator: &[Hash32], stop: &Hash32, max: usize) -> Vec<BlockHeader>;
    fn start_height(&self) -> u32;
}

/// What a handled message asks the node to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOutput {
    Send(Message),
    NewAddresses(Vec<AddressRecord>),
    BlockReceived(Block),
    HeadersReceived(Vec<BlockHeader>),
}

#[derive(Debug)]
pub struct Peer {
    pub index: usize,
    pub address: NetworkAddress,
    pub direction: Direction,
    pub state: PeerState,
    pub accept_us: bool,
    pub accept_them: bool,
    /// Best height the peer reported in its version message.
    pub chain_height: u32,
    pub connected_at: SystemTime,
    sent_version: bool,
}

impl Peer {
    pub fn outbound(index: usize, address: NetworkAddress) -> Self {
        Self::new(index, address, Direction::Outbound)
    }

    pub fn inbound(index: usize, address: NetworkAddress) -> Self {
        Self::new(index, address, Direction::Inbound)
    }

    fn new(index: usize, address: NetworkAddress, direction: Direction) -> Self {
        Peer {
            index,
            address,
            direction,
            state: PeerState::Connecting,
            accept_us: false,
            accept_them: false,
            chain_height: 0,
            connected_at: SystemTime::now(),
            sent_version: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.accept_us && self.accept_them
    }

    pub fn close(&mut self) {
        self.state = PeerState::Closed;
    }

    /// Outbound connect succeeded: introduce ourselves.
    /// Inbound peers instead wait for the remote version first.
    pub fn start_handshake(
        &mut self,
        config: &Config,
        view: &dyn NodeView,
        now: i64,
    ) -> Vec<PeerOutput> {
        debug_assert_eq!(self.direction, Direction::Outbound);
        let version = self.make_version(config, view, now);
        self.sent_version = true;
        self.state = PeerState::SentVersion;
        vec![PeerOutput::Send(Message::Version(version))]
    }

    fn make_version(&self, config: &Config, view: &dyn NodeView, now: i64) -> VersionPayload {
        VersionPayload {
            version: config.protocol_version,
            services: config.services,
            timestamp: now,
            addr_recv: self.address,
            addr_from: NetworkAddress {
                services: config.services,
                ..NetworkAddress::unspecified()
            },
            nonce: rand::thread_rng().gen(),
            user_agent: config.user_agent.as_bytes().to_vec(),
            start_height: view.start_height() as i32,
            relay: true,
        }
    }

    fn violation(&mut self, what: &str) -> NodeError {
        self.state = PeerState::Closed;
        NodeError::ProtocolViolation(format!("peer {}: {}", self.index, what))
    }

    /// Recompute the handshake state and emit the on-ready actions.
    fn refresh_state(&mut self, outputs: &mut Vec<PeerOutput>) {
        if self.state == PeerState::Closed {
            return;
        }
        if self.is_ready() {
            if self.state != PeerState::Ready {
                self.state = PeerState::Ready;
                log::info!("peer {} ready", self.index);
                outputs.push(PeerOutput::Send(Message::GetAddr));
            }
        } else if self.accept_us || self.accept_them {
            self.state = PeerState::HalfDone;
        } else if self.sent_version {
            self.state = PeerState::SentVersion;
        }
    }

    pub fn handle_message(
        &mut self,
        message: Message,
        config: &Config,
        view: &dyn NodeView,
        now: i64,
    ) -> Result<Vec<PeerOutput>, NodeError> {
        if self.state == PeerState::Closed {
            return Err(NodeError::ProtocolViolation(format!(
                "peer {}: message after close",
                self.index
            )));
        }

        let mut outputs = Vec::new();

        match message {
            Message::Version(payload) => {
                if self.accept_them || self.state == PeerState::Ready {
                    return Err(self.violation("duplicate version"));
                }
                if payload.version < config.min_peer_version {
                    return Err(self.violation("peer version below minimum"));
                }
                self.accept_them = true;
                self.chain_height = payload.start_height.max(0) as u32;
                if !self.sent_version {
                    let version = self.make_version(config, view, now);
                    self.sent_version = true;
                    outputs.push(PeerOutput::Send(Message::Version(version)));
                }
                outputs.push(PeerOutput::Send(Message::Verack));
            }
            Message::Verack => {
                if self.accept_us || self.state == PeerState::Ready {
                    return Err(self.violation("duplicate verack"));
                }
                if !self.sent_version {
                    return Err(self.violation("verack before version"));
                }
                self.accept_us = true;
            }
            other => {
                if !self.is_ready() {
                    return Err(self.violation("non-handshake message before ready"));
                }
                self.handle_ready_message(other, view, &mut outputs);
            }
        }

        self.refresh_state(&mut outputs);
        Ok(outputs)
    }

    fn handle_ready_message(
        &mut self,
        message: Message,
        view: &dyn NodeView,
        outputs: &mut Vec<PeerOutput>,
    ) {
        match message {
            Message::Addr(records) => outputs.push(PeerOutput::NewAddresses(records)),
            Message::Inv(entries) => {
                let wanted: Vec<InventoryVector> = entries
                    .into_iter()
                    .filter(|entry| match entry.kind {
                        INV_BLOCK => !view.has_block(&entry.hash),
                        INV_TX => !view.has_tx(&entry.hash),
                        _ => false,
                    })
                    .collect();
                if !wanted.is_empty() {
                    outputs.push(PeerOutput::Send(Message::GetData(wanted)));
                }
            }
            Message::Block(block) => outputs.push(PeerOutput::BlockReceived(block)),
            Message::Headers(headers) => outputs.push(PeerOutput::HeadersReceived(headers)),
            Message::Ping(nonce) => outputs.push(PeerOutput::Send(Message::Pong(nonce))),
            Message::Pong(nonce) => log::debug!("peer {}: pong {}", self.index, nonce),
            Message::GetAddr => {
                let records = view.addr_snapshot(MAX_ADDR_ENTRIES as usize);
                outputs.push(PeerOutput::Send(Message::Addr(records)));
            }
            Message::GetData(entries) => {
                let mut missing = Vec::new();
                for entry in entries {
                    match entry.kind {
                        INV_BLOCK => match view.fetch_block(&entry.hash) {
                            Some(block) => outputs.push(PeerOutput::Send(Message::Block(block))),
                            None => missing.push(entry),
                        },
                        _ => missing.push(entry),
                    }
                }
                if !missing.is_empty() {
                    outputs.push(PeerOutput::Send(Message::NotFound(missing)));
                }
            }
            Message::GetHeaders(payload) => {
                let headers = view.headers_after(
                    &payload.locator_hashes,
                    &payload.hash_stop,
                    MAX_HEADERS_ENTRIES as usize,
                );
                outputs.push(PeerOutput::Send(Message::Headers(headers)));
            }
            Message::GetBlocks(payload) => {
                let entries: Vec<InventoryVector> = view
                    .headers_after(&payload.locator_hashes, &payload.hash_stop, MAX_GETBLOCKS_REPLY)
                    .iter()
                    .map(|header| InventoryVector::block(header.hash()))
                    .collect();
                if !entries.is_empty() {
                    outputs.push(PeerOutput::Send(Message::Inv(entries)));
                }
            }
            Message::Tx(tx) => log::debug!("peer {}: ignoring tx {}", self.index, tx.txid()),
            Message::NotFound(entries) => {
                log::debug!("peer {}: notfound for {} entries", self.index, entries.len())
            }
            Message::Reject(payload) => log::warn!(
                "peer {}: reject '{}' code {:#04x}: {}",
                self.index,
                String::from_utf8_lossy(&payload.message),
                payload.ccode,
                String::from_utf8_lossy(&payload.reason),
            ),
            Message::Version(_) | Message::Verack => unreachable!("handled in handshake"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::dsha256;
    use crate::network::codec::ByteReader;

    struct MockView {
        known_blocks: Vec<Hash32>,
        block: Option<Block>,
        addrs: Vec<AddressRecord>,
    }

    impl Default for MockView {
        fn default() -> Self {
            MockView {
                known_blocks: vec![],
                block: None,
                addrs: vec![],
            }
        }
    }

    impl NodeView for MockView {
        fn has_block(&self, hash: &Hash32) -> bool {
            self.known_blocks.contains(hash)
        }
        fn has_tx(&self, _hash: &Hash32) -> bool {
            false
        }
        fn fetch_block(&self, hash: &Hash32) -> Option<Block> {
            self.block
                .as_ref()
                .filter(|b| b.header.hash() == *hash)
                .cloned()
        }
        fn addr_snapshot(&self, max: usize) -> Vec<AddressRecord> {
            self.addrs.iter().take(max).cloned().collect()
        }
        fn headers_after(&self, _: &[Hash32], _: &Hash32, _: usize) -> Vec<BlockHeader> {
            vec![]
        }
        fn start_height(&self) -> u32 {
            0
        }
    }

    fn config() -> Config {
        Config::default()
    }

    fn peer_address() -> NetworkAddress {
        NetworkAddress::new(0x01, "138.68.93.0:8333".parse().unwrap())
    }

    fn remote_version(version: i32) -> Message {
        Message::Version(VersionPayload {
            version,
            services: 1,
            timestamp: 0,
            addr_recv: NetworkAddress::unspecified(),
            addr_from: NetworkAddress::unspecified(),
            nonce: 9,
            user_agent: b"/other:1.0/".to_vec(),
            start_height: 700_000,
            relay: true,
        })
    }

    fn genesis_block() -> Block {
        let fixture = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/genesis.dat"));
        let mut r = ByteReader::new(&fixture[24..]);
        Block::parse(&mut r).unwrap()
    }

    #[test]
    fn test_outbound_handshake_to_ready() {
        let view = MockView::default();
        let cfg = config();
        let mut peer = Peer::outbound(0, peer_address());

        let outputs = peer.start_handshake(&cfg, &view, 1_700_000_000);
        assert!(matches!(outputs[0], PeerOutput::Send(Message::Version(_))));
        assert_eq!(peer.state, PeerState::SentVersion);

        let outputs = peer
            .handle_message(remote_version(70015), &cfg, &view, 0)
            .unwrap();
        assert_eq!(outputs, vec![PeerOutput::Send(Message::Verack)]);
        assert_eq!(peer.state, PeerState::HalfDone);
        assert!(peer.accept_them);
        assert_eq!(peer.chain_height, 700_000);

        let outputs = peer.handle_message(Message::Verack, &cfg, &view, 0).unwrap();
        assert_eq!(outputs, vec![PeerOutput::Send(Message::GetAddr)]);
        assert_eq!(peer.state, PeerState::Ready);
        assert!(peer.is_ready());
    }

    #[test]
    fn test_inbound_sends_version_after_theirs() {
        let view = MockView::default();
        let cfg = config();
        let mut peer = Peer::inbound(3, peer_address());
        assert_eq!(peer.state, PeerState::Connecting);

        let outputs = peer
            .handle_message(remote_version(70015), &cfg, &view, 0)
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(matches!(outputs[0], PeerOutput::Send(Message::Version(_))));
        assert!(matches!(outputs[1], PeerOutput::Send(Message::Verack)));
    }

    #[test]
    fn test_old_version_rejected() {
        let view = MockView::default();
        let cfg = config();
        let mut peer = Peer::inbound(0, peer_address());
        let result = peer.handle_message(remote_version(cfg.min_peer_version - 1), &cfg, &view, 0);
        assert!(matches!(result, Err(NodeError::ProtocolViolation(_))));
        assert_eq!(peer.state, PeerState::Closed);
    }

    #[test]
    fn test_message_before_ready_is_violation() {
        let view = MockView::default();
        let cfg = config();
        let mut peer = Peer::outbound(0, peer_address());
        peer.start_handshake(&cfg, &view, 0);
        let result = peer.handle_message(Message::Ping(1), &cfg, &view, 0);
        assert!(matches!(result, Err(NodeError::ProtocolViolation(_))));
        assert_eq!(peer.state, PeerState::Closed);
    }

    fn ready_peer(view: &MockView, cfg: &Config) -> Peer {
        let mut peer = Peer::outbound(0, peer_address());
        peer.start_handshake(cfg, view, 0);
        peer.handle_message(remote_version(70015), cfg, view, 0)
            .unwrap();
        peer.handle_message(Message::Verack, cfg, view, 0).unwrap();
        peer
    }

    #[test]
    fn test_ping_answered_with_same_nonce() {
        let view = MockView::default();
        let cfg = config();
        let mut peer = ready_peer(&view, &cfg);
        let outputs = peer
            .handle_message(Message::Ping(0xABCD), &cfg, &view, 0)
            .unwrap();
        assert_eq!(outputs, vec![PeerOutput::Send(Message::Pong(0xABCD))]);
    }

    #[test]
    fn test_inv_requests_only_unknown() {
        let known = dsha256(b"known block");
        let unknown = dsha256(b"unknown block");
        let view = MockView {
            known_blocks: vec![known],
            ..MockView::default()
        };
        let cfg = config();
        let mut peer = ready_peer(&view, &cfg);

        let outputs = peer
            .handle_message(
                Message::Inv(vec![
                    InventoryVector::block(known),
                    InventoryVector::block(unknown),
                ]),
                &cfg,
                &view,
                0,
            )
            .unwrap();
        assert_eq!(
            outputs,
            vec![PeerOutput::Send(Message::GetData(vec![
                InventoryVector::block(unknown)
            ]))]
        );
    }

    #[test]
    fn test_getdata_serves_block_or_notfound() {
        let block = genesis_block();
        let hash = block.header.hash();
        let view = MockView {
            block: Some(block.clone()),
            ..MockView::default()
        };
        let cfg = config();
        let mut peer = ready_peer(&view, &cfg);

        let miss = dsha256(b"missing");
        let outputs = peer
            .handle_message(
                Message::GetData(vec![
                    InventoryVector::block(hash),
                    InventoryVector::block(miss),
                ]),
                &cfg,
                &view,
                0,
            )
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0], PeerOutput::Send(Message::Block(block)));
        assert_eq!(
            outputs[1],
            PeerOutput::Send(Message::NotFound(vec![InventoryVector::block(miss)]))
        );
    }

    #[test]
    fn test_addr_and_block_events_forwarded() {
        let view = MockView::default();
        let cfg = config();
        let mut peer = ready_peer(&view, &cfg);

        let record = AddressRecord {
            timestamp: 1,
            address: peer_address(),
        };
        let outputs = peer
            .handle_message(Message::Addr(vec![record]), &cfg, &view, 0)
            .unwrap();
        assert_eq!(outputs, vec![PeerOutput::NewAddresses(vec![record])]);

        let block = genesis_block();
        let outputs = peer
            .handle_message(Message::Block(block.clone()), &cfg, &view, 0)
            .unwrap();
        assert_eq!(outputs, vec![PeerOutput::BlockReceived(block)]);
    }

    #[test]
    fn test_version_after_ready_is_violation() {
        let view = MockView::default();
        let cfg = config();
        let mut peer = ready_peer(&view, &cfg);
        let result = peer.handle_message(remote_version(70015), &cfg, &view, 0);
        assert!(matches!(result, Err(NodeError::ProtocolViolation(_))));
    }
}
