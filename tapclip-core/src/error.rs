//! Error taxonomy for the transfer state machines. Lower-level failures (codec,
//! file I/O) are converted into one of these kinds at the component boundary.

use std::io;

use crate::config::ConfigError;
use crate::wire::WireError;

/// Why a handshake (or payload kind) was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MismatchKind {
    #[error("bad magic header")]
    Magic,
    #[error("application identifier mismatch")]
    Aid,
    #[error("local version {local} outside offered range [{min}, {max}]")]
    Version { min: u8, max: u8, local: u8 },
    #[error("unknown payload kind {0:#04x}")]
    Kind(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(#[from] MismatchKind),
    #[error(transparent)]
    Malformed(#[from] WireError),
    #[error("malformed message: {0}")]
    Invalid(&'static str),
    #[error("chunk {index} failed integrity check (claimed {claimed:#010x}, computed {actual:#010x})")]
    ChunkIntegrityMismatch { index: u32, claimed: i32, actual: i32 },
    #[error("reassembled payload does not match digest {digest}")]
    PayloadIntegrityMismatch { digest: String },
    #[error("no successful round trip for {ticks} ticks")]
    TransportTimeout { ticks: u32 },
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),
    #[error("peer reported failure")]
    Rejected,
    #[error("chunk {index} stored out of sequence (sought {sought})")]
    OutOfSequence { index: u32, sought: u32 },
    #[error("transport frame of {capacity} bytes leaves no room for chunk data")]
    FrameTooSmall { capacity: u32 },
    #[error("payload of {len} bytes exceeds the 4-byte size field")]
    TooLarge { len: u64 },
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TransferError {
    /// Whether the error indicates a malformed or truncated message.
    pub fn is_malformed(&self) -> bool {
        matches!(self, TransferError::Malformed(_) | TransferError::Invalid(_))
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

/// The physical link dropped during an exchange. Ends the connection attempt, not the transfer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connection lost")]
    ConnectionLost,
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
}
