//! Transaction wire format, with optional segregated-witness data.

use crate::crypto::{dsha256, Hash32};
use crate::error::ParseError;
use crate::network::codec::{ByteReader, ByteWriter};

/// Previous-output index marking a coinbase input.
pub const COINBASE_INDEX: u32 = 0xFFFF_FFFF;

/// Upper bound on script and witness-item lengths accepted from the wire.
pub const MAX_SCRIPT_LEN: u64 = 10_000;

const WITNESS_MARKER: u8 = 0x00;
const WITNESS_FLAG: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub hash: Hash32,
    pub index: u32,
}

impl OutPoint {
    pub fn is_coinbase(&self) -> bool {
        self.hash.is_zero() && self.index == COINBASE_INDEX
    }

    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(OutPoint {
            hash: r.read_hash()?,
            index: r.read_u32_le()?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_hash(&self.hash);
        w.put_u32_le(self.index);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_coinbase(&self) -> bool {
        self.previous_output.is_coinbase()
    }

    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(TxIn {
            previous_output: OutPoint::parse(r)?,
            signature_script: r.read_var_str(MAX_SCRIPT_LEN)?,
            sequence: r.read_u32_le()?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        self.previous_output.serialize(w);
        w.put_var_bytes(&self.signature_script);
        w.put_u32_le(self.sequence);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Value in satoshis.
    pub value: i64,
    pub pk_script: Vec<u8>,
}

impl TxOut {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        Ok(TxOut {
            value: r.read_i64_le()?,
            pk_script: r.read_var_str(MAX_SCRIPT_LEN)?,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_i64_le(self.value);
        w.put_var_bytes(&self.pk_script);
    }
}

/// Witness stack for one input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxWitness {
    pub items: Vec<Vec<u8>>,
}

impl TxWitness {
    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        let count = r.read_var_int()?;
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(r.read_var_str(MAX_SCRIPT_LEN)?);
        }
        Ok(TxWitness { items })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_var_int(self.items.len() as u64);
        for item in &self.items {
            w.put_var_bytes(item);
        }
    }
}

/// A transaction. `witnesses` is `Some` iff the marker/flag pair was present
/// on the wire, in which case it carries one stack per input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub witnesses: Option<Vec<TxWitness>>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.witnesses.is_some()
    }

    pub fn parse(r: &mut ByteReader) -> Result<Self, ParseError> {
        let version = r.read_i32_le()?;

        let has_witness = matches!(r.peek(2), Some([WITNESS_MARKER, WITNESS_FLAG]));
        if has_witness {
            r.read(2)?;
        }

        let input_count = r.read_var_int()?;
        let mut inputs = Vec::new();
        for _ in 0..input_count {
            inputs.push(TxIn::parse(r)?);
        }

        let output_count = r.read_var_int()?;
        let mut outputs = Vec::new();
        for _ in 0..output_count {
            outputs.push(TxOut::parse(r)?);
        }

        let witnesses = if has_witness {
            let mut stacks = Vec::with_capacity(inputs.len());
            for _ in 0..inputs.len() {
                stacks.push(TxWitness::parse(r)?);
            }
            Some(stacks)
        } else {
            None
        };

        let lock_time = r.read_u32_le()?;

        Ok(Transaction {
            version,
            inputs,
            outputs,
            witnesses,
            lock_time,
        })
    }

    pub fn serialize(&self, w: &mut ByteWriter) {
        w.put_i32_le(self.version);

        if let Some(witnesses) = &self.witnesses {
            w.put_u8(WITNESS_MARKER);
            w.put_u8(WITNESS_FLAG);

            w.put_var_int(self.inputs.len() as u64);
            for input in &self.inputs {
                input.serialize(w);
            }
            w.put_var_int(self.outputs.len() as u64);
            for output in &self.outputs {
                output.serialize(w);
            }
            for witness in witnesses {
                witness.serialize(w);
            }
        } else {
            w.put_var_int(self.inputs.len() as u64);
            for input in &self.inputs {
                input.serialize(w);
            }
            w.put_var_int(self.outputs.len() as u64);
            for output in &self.outputs {
                output.serialize(w);
            }
        }

        w.put_u32_le(self.lock_time);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.serialize(&mut w);
        w.into_bytes()
    }

    /// Double SHA-256 of the serialized transaction.
    pub fn txid(&self) -> Hash32 {
        dsha256(&self.to_bytes())
    }
}
