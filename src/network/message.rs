//! Protocol messages: the 24-byte header and a total parse/serialize pair
//! for every recognized command.
//!
//! The serializer is the single source of truth for checksums: a header is
//! always computed over the payload bytes that are actually sent.

use crate::blockchain::{Block, BlockHeader, Transaction};
use crate::crypto::{dsha256, Hash32};
use crate::error::ParseError;
use crate::network::codec::{ByteReader, ByteWriter};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub const MESSAGE_HEADER_LEN: usize = 24;
pub const COMMAND_LEN: usize = 12;
pub const CHECKSUM_LEN: usize = 4;

/// Protocol caps on repeated elements, per message kind.
pub const MAX_INV_ENTRIES: u64 = 50_000;
pub const MAX_ADDR_ENTRIES: u64 = 1_000;
pub const MAX_HEADERS_ENTRIES: u64 = 2_000;
pub const MAX_LOCATOR_HASHES: u64 = 2_000;
pub const MAX_USER_AGENT_LEN: u64 = 256;
pub const MAX_REJECT_FIELD_LEN: u64 = 111;

/// Inventory object types.
pub const INV_ERROR: u32 = 0;
pub const INV_TX: u32 = 1;
pub const INV_BLOCK: u32 = 2;
pub const INV_FILTERED_BLOCK: u32 = 3;
pub const INV_CMPCT_BLOCK: u32 = 4;

/// First four bytes of double-SHA-256 over the payload.
pub fn payload_checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    dsha256(payload).as_bytes()[..CHECKSUM_LEN]
        .try_into()
        .unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    /// ASCII command name, zero-padded.
    pub command: [u8; COMMAND_LEN],
    pub length: u32,
    pub checksum: [u8; CHECKSUM_LEN],
}

impl MessageHeader {
    pub fn new(magic: u32, command: &str, payload: &[u8]) -> Self {
        let mut cmd = [0u8; COMMAND_LEN];
        cmd[..command.len()].copy_from_slice(command.as_bytes());
        MessageHeader {
            magic,
            command: cmd,
            length: payload.len() as u32,
            checksum: payload_checksum(payload),
        }
    }

    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(MessageHeader {
            magic: r.read_u32_le()?,
            command: r.read(COMMAND_LEN)?.try_into().unwrap(),
            length: r.read_u32_le()?,
            checksum: r.read(CHECKSUM_LEN)?.try_into().unwrap(),
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_u32_le(self.magic);
        w.put(&self.command);
        w.put_u32_le(self.length);
        w.put(&self.checksum);
    }

    /// Command with the zero padding stripped; lossy for non-ASCII garbage.
    pub fn command_str(&self) -> String {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_LEN);
        String::from_utf8_lossy(&self.command[..end]).into_owned()
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == payload_checksum(payload)
    }
}

/// Services + IPv6-mapped IP + big-endian port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(services: u64, addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        NetworkAddress {
            services,
            ip,
            port: addr.port(),
        }
    }

    pub fn unspecified() -> Self {
        NetworkAddress {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(NetworkAddress {
            services: r.read_u64_le()?,
            ip: r.read(16)?.try_into().unwrap(),
            port: r.read_u16_be()?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_u64_le(self.services);
        w.put(&self.ip);
        w.put_u16_be(self.port);
    }
}

/// Timestamped network address, the `addr` message element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    pub timestamp: u32,
    pub address: NetworkAddress,
}

impl AddressRecord {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(AddressRecord {
            timestamp: r.read_u32_le()?,
            address: NetworkAddress::parse(r)?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_u32_le(self.timestamp);
        self.address.serialize(w);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryVector {
    pub kind: u32,
    pub hash: Hash32,
}

impl InventoryVector {
    pub fn block(hash: Hash32) -> Self {
        InventoryVector {
            kind: INV_BLOCK,
            hash,
        }
    }

    pub fn tx(hash: Hash32) -> Self {
        InventoryVector { kind: INV_TX, hash }
    }

    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(InventoryVector {
            kind: r.read_u32_le()?,
            hash: r.read_hash()?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_u32_le(self.kind);
        w.put_hash(&self.hash);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: Vec<u8>,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionPayload {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(VersionPayload {
            version: r.read_i32_le()?,
            services: r.read_u64_le()?,
            timestamp: r.read_i64_le()?,
            addr_recv: NetworkAddress::parse(r)?,
            addr_from: NetworkAddress::parse(r)?,
            nonce: r.read_u64_le()?,
            user_agent: r.read_var_str(MAX_USER_AGENT_LEN)?,
            start_height: r.read_i32_le()?,
            // Pre-BIP37 peers omit the relay flag.
            relay: if r.is_empty() { true } else { r.read_u8()? != 0 },
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) -> Result<(), ParseError> {
        w.put_i32_le(self.version);
        w.put_u64_le(self.services);
        w.put_i64_le(self.timestamp);
        self.addr_recv.serialize(w);
        self.addr_from.serialize(w);
        w.put_u64_le(self.nonce);
        w.put_var_str(&self.user_agent, MAX_USER_AGENT_LEN)?;
        w.put_i32_le(self.start_height);
        w.put_u8(self.relay as u8);
        Ok(())
    }
}

/// Shared payload of `getheaders` and `getblocks`: a block locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocatorPayload {
    pub version: u32,
    pub locator_hashes: Vec<Hash32>,
    pub hash_stop: Hash32,
}

impl BlockLocatorPayload {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        let version = r.read_u32_le()?;
        let count = r.read_var_int()?;
        if count > MAX_LOCATOR_HASHES {
            return Err(ParseError::Malformed("locator hash count"));
        }
        let mut locator_hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locator_hashes.push(r.read_hash()?);
        }
        Ok(BlockLocatorPayload {
            version,
            locator_hashes,
            hash_stop: r.read_hash()?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_u32_le(self.version);
        w.put_var_int(self.locator_hashes.len() as u64);
        for hash in &self.locator_hashes {
            w.put_hash(hash);
        }
        w.put_hash(&self.hash_stop);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectPayload {
    /// Command being rejected.
    pub message: Vec<u8>,
    pub ccode: u8,
    pub reason: Vec<u8>,
    /// Hash of the rejected object, when one applies.
    pub data: Option<Hash32>,
}

impl RejectPayload {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        let message = r.read_var_str(MAX_REJECT_FIELD_LEN)?;
        let ccode = r.read_u8()?;
        let reason = r.read_var_str(MAX_REJECT_FIELD_LEN)?;
        let data = if r.remaining() >= 32 {
            Some(r.read_hash()?)
        } else {
            None
        };
        Ok(RejectPayload {
            message,
            ccode,
            reason,
            data,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) -> Result<(), ParseError> {
        w.put_var_str(&self.message, MAX_REJECT_FIELD_LEN)?;
        w.put_u8(self.ccode);
        w.put_var_str(&self.reason, MAX_REJECT_FIELD_LEN)?;
        if let Some(hash) = &self.data {
            w.put_hash(hash);
        }
        Ok(())
    }
}

/// Every recognized protocol message. Command dispatch is a match over the
/// variant; unknown commands are skipped upstream rather than parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Addr(Vec<AddressRecord>),
    GetAddr,
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    NotFound(Vec<InventoryVector>),
    Block(Block),
    Tx(Transaction),
    GetHeaders(BlockLocatorPayload),
    GetBlocks(BlockLocatorPayload),
    Headers(Vec<BlockHeader>),
    Ping(u64),
    Pong(u64),
    Reject(RejectPayload),
}

fn parse_inventory(r: &mut ByteReader) -> Result<Vec<InventoryVector>, ParseError> {
    let count = r.read_var_int()?;
    if count > MAX_INV_ENTRIES {
        return Err(ParseError::Malformed("inventory count"));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(InventoryVector::parse(r)?);
    }
    Ok(entries)
}

fn serialize_inventory(entries: &[InventoryVector], w: &mut ByteWriter) {
    w.put_var_int(entries.len() as u64);
    for entry in entries {
        entry.serialize(w);
    }
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::GetHeaders(_) => "getheaders",
            Message::GetBlocks(_) => "getblocks",
            Message::Headers(_) => "headers",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Reject(_) => "reject",
        }
    }

    pub fn serialize_payload(&self) -> Result<Vec<u8>, ParseError> {
        let mut w = ByteWriter::new();
        match self {
            Message::Version(payload) => payload.serialize(&mut w)?,
            Message::Verack | Message::GetAddr => {}
            Message::Addr(records) => {
                w.put_var_int(records.len() as u64);
                for record in records {
                    record.serialize(&mut w);
                }
            }
            Message::Inv(entries) | Message::GetData(entries) | Message::NotFound(entries) => {
                serialize_inventory(entries, &mut w);
            }
            Message::Block(block) => block.serialize(&mut w),
            Message::Tx(tx) => tx.serialize(&mut w),
            Message::GetHeaders(payload) | Message::GetBlocks(payload) => {
                payload.serialize(&mut w);
            }
            Message::Headers(headers) => {
                w.put_var_int(headers.len() as u64);
                for header in headers {
                    header.serialize(&mut w);
                    w.put_var_int(0); // header entries carry no transactions
                }
            }
            Message::Ping(nonce) | Message::Pong(nonce) => w.put_u64_le(*nonce),
            Message::Reject(payload) => payload.serialize(&mut w)?,
        }
        Ok(w.into_bytes())
    }

    /// Serialize into a full frame. The checksum is computed over the payload
    /// bytes produced right here, never over a stale buffer.
    pub fn to_bytes(&self, magic: u32) -> Result<Vec<u8>, ParseError> {
        let payload = self.serialize_payload()?;
        let header = MessageHeader::new(magic, self.command(), &payload);
        let mut w = ByteWriter::new();
        header.serialize(&mut w);
        w.put(&payload);
        Ok(w.into_bytes())
    }

    fn parse_payload_body(command: &str, payload: &[u8]) -> Result<Option<Message>, ParseError> {
        let mut r = ByteReader::new(payload);
        let message = match command {
            "version" => Message::Version(VersionPayload::parse(&mut r)?),
            "verack" => Message::Verack,
            "addr" => {
                let count = r.read_var_int()?;
                if count > MAX_ADDR_ENTRIES {
                    return Err(ParseError::Malformed("addr count"));
                }
                let mut records = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    records.push(AddressRecord::parse(&mut r)?);
                }
                Message::Addr(records)
            }
            "getaddr" => Message::GetAddr,
            "inv" => Message::Inv(parse_inventory(&mut r)?),
            "getdata" => Message::GetData(parse_inventory(&mut r)?),
            "notfound" => Message::NotFound(parse_inventory(&mut r)?),
            "block" => Message::Block(Block::parse(&mut r)?),
            "tx" => Message::Tx(Transaction::parse(&mut r)?),
            "getheaders" => Message::GetHeaders(BlockLocatorPayload::parse(&mut r)?),
            "getblocks" => Message::GetBlocks(BlockLocatorPayload::parse(&mut r)?),
            "headers" => {
                let count = r.read_var_int()?;
                if count > MAX_HEADERS_ENTRIES {
                    return Err(ParseError::Malformed("headers count"));
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(BlockHeader::parse(&mut r)?);
                    r.read_var_int()?; // trailing tx count, ignored
                }
                Message::Headers(headers)
            }
            "ping" => Message::Ping(r.read_u64_le()?),
            "pong" => Message::Pong(r.read_u64_le()?),
            "reject" => Message::Reject(RejectPayload::parse(&mut r)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    /// Parse a payload for a framed header. Returns `Ok(None)` for commands
    /// outside the recognized set, which callers skip rather than treat as
    /// fatal.
    pub fn parse_frame(
        header: &MessageHeader,
        payload: &[u8],
        expected_magic: u32,
    ) -> Result<Option<Message>, ParseError> {
        if header.magic != expected_magic {
            return Err(ParseError::BadMagic {
                expected: expected_magic,
                found: header.magic,
            });
        }
        if header.length as usize != payload.len() {
            return Err(ParseError::Malformed("payload length"));
        }
        if !header.verify_checksum(payload) {
            return Err(ParseError::ChecksumMismatch);
        }
        Self::parse_payload_body(&header.command_str(), payload)
    }

    /// Parse one whole message from a buffer starting at its header.
    pub fn parse_bytes(
        bytes: &[u8],
        expected_magic: u32,
        max_length: u32,
    ) -> Result<(MessageHeader, Option<Message>), ParseError> {
        let mut r = ByteReader::new(bytes);
        let header = MessageHeader::parse(&mut r)?;
        if header.length > max_length {
            return Err(ParseError::Malformed("payload length over ceiling"));
        }
        let payload = r.read(header.length as usize)?;
        let message = Self::parse_frame(&header, payload, expected_magic)?;
        Ok((header, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkType;
    use hex_literal::hex;

    const MAGIC: u32 = 0xD9B4_BEF9;

    const GENESIS_HASH: [u8; 32] =
        hex!("6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000");

    fn sample_address() -> NetworkAddress {
        NetworkAddress::new(0x01, "138.68.93.0:8333".parse().unwrap())
    }

    fn sample_version() -> Message {
        Message::Version(VersionPayload {
            version: 70015,
            services: 0x409,
            timestamp: 1_700_000_000,
            addr_recv: sample_address(),
            addr_from: NetworkAddress::unspecified(),
            nonce: 0xDEAD_BEEF,
            user_agent: b"/bitpeer:0.1.0/".to_vec(),
            start_height: 0,
            relay: true,
        })
    }

    fn roundtrip(message: Message) {
        let bytes = message.to_bytes(MAGIC).unwrap();
        let (header, parsed) = Message::parse_bytes(&bytes, MAGIC, 32 * 1024 * 1024).unwrap();
        assert_eq!(header.command_str(), message.command());
        let parsed = parsed.expect("recognized command");
        assert_eq!(parsed, message);
        // Canonical byte stability.
        assert_eq!(parsed.to_bytes(MAGIC).unwrap(), bytes);
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let inv = vec![
            InventoryVector::block(Hash32::from_bytes(GENESIS_HASH)),
            InventoryVector::tx(dsha256(b"tx")),
        ];
        let locator = BlockLocatorPayload {
            version: 70015,
            locator_hashes: vec![Hash32::from_bytes(GENESIS_HASH)],
            hash_stop: Hash32::zero(),
        };
        let header = crate::blockchain::BlockHeader {
            version: 1,
            prev_block: Hash32::from_bytes(GENESIS_HASH),
            merkle_root: dsha256(b"merkle"),
            timestamp: 1_231_469_665,
            target: 0x1D00_FFFF,
            nonce: 2_573_394_689,
        };

        roundtrip(sample_version());
        roundtrip(Message::Verack);
        roundtrip(Message::GetAddr);
        roundtrip(Message::Addr(vec![AddressRecord {
            timestamp: 1_700_000_000,
            address: sample_address(),
        }]));
        roundtrip(Message::Inv(inv.clone()));
        roundtrip(Message::GetData(inv.clone()));
        roundtrip(Message::NotFound(inv));
        roundtrip(Message::GetHeaders(locator.clone()));
        roundtrip(Message::GetBlocks(locator));
        roundtrip(Message::Headers(vec![header, header]));
        roundtrip(Message::Ping(7));
        roundtrip(Message::Pong(7));
        roundtrip(Message::Reject(RejectPayload {
            message: b"block".to_vec(),
            ccode: 0x10,
            reason: b"invalid".to_vec(),
            data: Some(Hash32::from_bytes(GENESIS_HASH)),
        }));
    }

    #[test]
    fn test_header_checksum_rule() {
        let message = sample_version();
        let payload = message.serialize_payload().unwrap();
        let bytes = message.to_bytes(MAGIC).unwrap();
        assert_eq!(&bytes[20..24], &payload_checksum(&payload));
        assert_eq!(bytes.len(), MESSAGE_HEADER_LEN + payload.len());
    }

    #[test]
    fn test_version_era_checksum_fixture() {
        // 69-byte payload fixture; expected checksum 84 f4 95 8d.
        let mut payload = Vec::new();
        payload.extend_from_slice(&hex!("7f110100"));
        payload.push(0x01);
        payload.extend_from_slice(&GENESIS_HASH);
        payload.extend_from_slice(&[0u8; 32]);
        assert_eq!(payload.len(), 69);
        assert_eq!(payload_checksum(&payload), hex!("84f4958d"));
    }

    #[test]
    fn test_getheaders_matches_reference_buffer() {
        let fixture = include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/fixtures/getheaders_initial.dat"
        ));
        let message = Message::GetHeaders(BlockLocatorPayload {
            version: 70015,
            locator_hashes: vec![Hash32::from_bytes(GENESIS_HASH)],
            hash_stop: Hash32::zero(),
        });
        let bytes = message
            .to_bytes(NetworkType::Mainnet.magic_bytes())
            .unwrap();
        assert_eq!(bytes, fixture.as_slice());
    }

    #[test]
    fn test_genesis_block_message_fixture() {
        let fixture = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/genesis.dat"));
        let (header, message) = Message::parse_bytes(fixture, MAGIC, 32 * 1024 * 1024).unwrap();
        assert_eq!(header.command_str(), "block");

        let block = match message.unwrap() {
            Message::Block(block) => block,
            other => panic!("expected block, got {}", other.command()),
        };
        assert_eq!(block.txs.len(), 1);
        assert_eq!(block.header.hash(), Hash32::from_bytes(GENESIS_HASH));
        assert_eq!(block.txs[0].txid(), block.header.merkle_root);

        // Byte-stable reserialization of a canonical frame.
        let message = Message::Block(block);
        assert_eq!(message.to_bytes(MAGIC).unwrap(), fixture.as_slice());
    }

    #[test]
    fn test_bad_magic_and_checksum() {
        let bytes = Message::Ping(1).to_bytes(MAGIC).unwrap();
        assert!(matches!(
            Message::parse_bytes(&bytes, 0x0709_110B, 1024),
            Err(ParseError::BadMagic { .. })
        ));

        let mut corrupted = bytes.clone();
        *corrupted.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            Message::parse_bytes(&corrupted, MAGIC, 1024),
            Err(ParseError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_unknown_command_skipped() {
        let payload = b"".to_vec();
        let header = MessageHeader::new(MAGIC, "mempool", &payload);
        let parsed = Message::parse_frame(&header, &payload, MAGIC).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_inv_count_bound() {
        let mut w = ByteWriter::new();
        w.put_var_int(MAX_INV_ENTRIES + 1);
        let payload = w.into_bytes();
        let header = MessageHeader::new(MAGIC, "inv", &payload);
        assert!(matches!(
            Message::parse_frame(&header, &payload, MAGIC),
            Err(ParseError::Malformed("inventory count"))
        ));
    }
}
