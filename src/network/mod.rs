//! Network layer: wire codec, message types, frame reassembly, the per-peer
//! state machine, the address book, and the node control loop.

pub mod addrbook;
pub mod codec;
pub mod framer;
pub mod message;
pub mod node;
pub mod peer;

// ---- Re-exports: codec layer ----
pub use self::codec::{var_int_width, ByteReader, ByteWriter};
pub use self::message::{
    payload_checksum, AddressRecord, BlockLocatorPayload, InventoryVector, Message, MessageHeader,
    NetworkAddress, RejectPayload, VersionPayload, INV_BLOCK, INV_CMPCT_BLOCK, INV_ERROR,
    INV_FILTERED_BLOCK, INV_TX, MESSAGE_HEADER_LEN,
};

// ---- Re-exports: peer layer ----
pub use self::addrbook::{dedupe_records, AddressBook, MAX_ADDR_CACHE};
pub use self::framer::{Frame, Framer, FramerState};
pub use self::node::{Node, NodeOptions, NodeState};
pub use self::peer::{Direction, NodeView, Peer, PeerOutput, PeerState};
