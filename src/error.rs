use thiserror::Error;

/// Framing failures while reassembling a peer's byte stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("truncated frame")]
    Truncated,

    #[error("frame payload length {length} exceeds ceiling {max}")]
    Oversize { length: u32, max: u32 },
}

/// Message-codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad magic: expected {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("truncated input")]
    Truncated,

    #[error("string length {len} exceeds bound {max}")]
    OversizeString { len: u64, max: u64 },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt {0}")]
    Corrupt(&'static str),
}

/// Top-level error type for the node.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] crate::consensus::InvalidBlock),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,
}

impl From<crate::config::ConfigError> for NodeError {
    fn from(error: crate::config::ConfigError) -> Self {
        NodeError::Config(format!("{}", error))
    }
}
