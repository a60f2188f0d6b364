//! Per-peer frame reassembly: turns an arbitrary byte stream into whole
//! `(header, payload)` frames. A chunk may complete zero, one, or many
//! frames; a frame may arrive across any number of chunks.

use crate::error::FrameError;
use crate::network::codec::ByteReader;
use crate::network::message::{MessageHeader, MESSAGE_HEADER_LEN};
use bytes::{Buf, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    /// Waiting for a new frame; the next bytes must begin with the magic.
    Idle,
    /// A header is buffered; accumulating until `expected_total` bytes.
    Collecting { expected_total: usize },
    /// A runaway length was seen; the peer must be closed.
    Poisoned,
}

/// A reassembled frame. Payload parsing happens downstream in the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

pub struct Framer {
    magic: u32,
    max_payload: u32,
    state: FramerState,
    buffer: BytesMut,
}

impl Framer {
    pub fn new(magic: u32, max_payload: u32) -> Self {
        Framer {
            magic,
            max_payload,
            state: FramerState::Idle,
            buffer: BytesMut::new(),
        }
    }

    pub fn state(&self) -> FramerState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one chunk of received bytes; returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        if self.state == FramerState::Poisoned {
            return Err(FrameError::Truncated);
        }

        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                FramerState::Idle => {
                    if self.buffer.len() < 4 {
                        break;
                    }
                    let found = u32::from_le_bytes(self.buffer[..4].try_into().unwrap());
                    if found != self.magic {
                        log::debug!(
                            "discarding {} bytes not starting with magic ({:#010x})",
                            self.buffer.len(),
                            found
                        );
                        self.buffer.clear();
                        break;
                    }
                    if self.buffer.len() < MESSAGE_HEADER_LEN {
                        break;
                    }
                    let header = self.parse_buffered_header();
                    if header.length > self.max_payload {
                        self.state = FramerState::Poisoned;
                        return Err(FrameError::Oversize {
                            length: header.length,
                            max: self.max_payload,
                        });
                    }
                    let expected_total = MESSAGE_HEADER_LEN + header.length as usize;
                    if self.buffer.len() >= expected_total {
                        frames.push(self.take_frame(header, expected_total));
                        // Remainder may hold further frames; reprocess.
                    } else {
                        self.state = FramerState::Collecting { expected_total };
                        break;
                    }
                }
                FramerState::Collecting { expected_total } => {
                    if self.buffer.len() < expected_total {
                        break;
                    }
                    let header = self.parse_buffered_header();
                    frames.push(self.take_frame(header, expected_total));
                    self.state = FramerState::Idle;
                }
                FramerState::Poisoned => unreachable!(),
            }
        }

        Ok(frames)
    }

    fn parse_buffered_header(&self) -> MessageHeader {
        let mut r = ByteReader::new(&self.buffer[..MESSAGE_HEADER_LEN]);
        MessageHeader::parse(&mut r).expect("24 bytes buffered")
    }

    fn take_frame(&mut self, header: MessageHeader, expected_total: usize) -> Frame {
        self.buffer.advance(MESSAGE_HEADER_LEN);
        let payload = self
            .buffer
            .split_to(expected_total - MESSAGE_HEADER_LEN)
            .to_vec();
        Frame { header, payload }
    }
}
