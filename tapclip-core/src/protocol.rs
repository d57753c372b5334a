//! tapclip wire protocol: handshake envelope, payload header, responses, chunk messages.
//!
//! ```text
//! first message:  [magic 4][aidLen 1][aid][min 1][max 1][kind 1][total u32][maxChunk u32][digest str][name str, File only]
//! response:       [status 2][bytesStored u32][nextChunk u32]       (failure: status only)
//! chunk message:  [hash i32][raw bytes to end of frame]
//! ```

use crate::error::{MismatchKind, Result, TransferError};
use crate::integrity::{self, CHUNK_HASH_LEN};
use crate::wire::{FrameReader, FrameWriter};

/// Magic bytes opening every first message (an ISO 7816 SELECT-by-AID APDU header).
pub const MAGIC: [u8; 4] = [0x00, 0xA4, 0x04, 0x00];

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

pub const STATUS_SUCCESS: [u8; 2] = [0x90, 0x00];
pub const STATUS_FAILED: [u8; 2] = [0x6F, 0x00];

/// Largest chunk the sender will negotiate regardless of what the transport reports.
/// Some links report capacities they can't sustain.
pub const DEFAULT_HARD_CAP: u32 = 1024;

/// Payload kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Clip,
    File,
}

impl PayloadKind {
    pub fn code(self) -> u8 {
        match self {
            PayloadKind::Clip => 0x02,
            PayloadKind::File => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x02 => Ok(PayloadKind::Clip),
            0x03 => Ok(PayloadKind::File),
            other => Err(MismatchKind::Kind(other).into()),
        }
    }
}

/// Preamble of the sender's first message on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub aid: Vec<u8>,
    pub min_version: u8,
    pub max_version: u8,
}

impl Handshake {
    pub fn new(aid: Vec<u8>, min_version: u8, max_version: u8) -> Self {
        Self {
            aid,
            min_version,
            max_version,
        }
    }

    pub fn write(&self, w: &mut FrameWriter) {
        w.write_raw(&MAGIC);
        w.write_u8(self.aid.len() as u8);
        w.write_raw(&self.aid);
        w.write_u8(self.min_version).write_u8(self.max_version);
    }

    /// Read and check the preamble against the local AID and version. Returns the
    /// offered handshake on success. Malformed input is reported before content checks.
    pub fn read_and_validate(
        r: &mut FrameReader<'_>,
        local_aid: &[u8],
        local_version: u8,
    ) -> Result<Self> {
        let magic = r.read_exact(MAGIC.len())?;
        if magic != MAGIC {
            return Err(MismatchKind::Magic.into());
        }
        let aid_len = r.read_u8()? as usize;
        let aid = r.read_exact(aid_len)?.to_vec();
        let min_version = r.read_u8()?;
        let max_version = r.read_u8()?;
        if aid != local_aid {
            return Err(MismatchKind::Aid.into());
        }
        if !(min_version..=max_version).contains(&local_version) {
            return Err(MismatchKind::Version {
                min: min_version,
                max: max_version,
                local: local_version,
            }
            .into());
        }
        Ok(Self {
            aid,
            min_version,
            max_version,
        })
    }
}

/// Metadata for one payload, sent after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub kind: PayloadKind,
    pub total_size: u32,
    pub max_chunk_len: u32,
    /// MD5 of the whole payload, 32 lowercase hex chars.
    pub digest: String,
    /// Present for [`PayloadKind::File`] only.
    pub file_name: Option<String>,
}

impl PayloadHeader {
    pub fn chunk_count(&self) -> u32 {
        crate::chunk::chunk_count(self.total_size, self.max_chunk_len)
    }

    pub fn write(&self, w: &mut FrameWriter) -> Result<()> {
        w.write_u8(self.kind.code())
            .write_int(self.total_size)
            .write_int(self.max_chunk_len);
        w.write_string(&self.digest)?;
        if self.kind == PayloadKind::File {
            w.write_string(self.file_name.as_deref().unwrap_or(""))?;
        }
        Ok(())
    }

    pub fn read(r: &mut FrameReader<'_>) -> Result<Self> {
        let kind = PayloadKind::from_code(r.read_u8()?)?;
        let total_size = r.read_int()?;
        let max_chunk_len = r.read_int()?;
        let digest = r.read_string()?;
        let file_name = match kind {
            PayloadKind::File => Some(r.read_string()?),
            PayloadKind::Clip => None,
        };
        if max_chunk_len == 0 {
            return Err(TransferError::Invalid("max chunk length is zero"));
        }
        if !integrity::is_digest(&digest) {
            return Err(TransferError::Invalid("digest is not 32 lowercase hex chars"));
        }
        if let Some(name) = &file_name {
            if !is_plain_file_name(name) {
                return Err(TransferError::Invalid("file name is empty or has a path"));
            }
        }
        Ok(Self {
            kind,
            total_size,
            max_chunk_len,
            digest,
            file_name,
        })
    }
}

/// A received file name must not escape the directory it's placed in.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Build the sender's first message for a connection.
pub fn encode_first_message(handshake: &Handshake, header: &PayloadHeader) -> Result<Vec<u8>> {
    let mut w = FrameWriter::with_capacity(64);
    handshake.write(&mut w);
    header.write(&mut w)?;
    Ok(w.into_bytes())
}

/// Receiver's answer to every inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Keep going: this many bytes are durably stored; send this chunk next.
    Continue { bytes_stored: u32, next_chunk: u32 },
    Failed,
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::with_capacity(10);
        match *self {
            Response::Continue {
                bytes_stored,
                next_chunk,
            } => {
                w.write_raw(&STATUS_SUCCESS)
                    .write_int(bytes_stored)
                    .write_int(next_chunk);
            }
            Response::Failed => {
                w.write_raw(&STATUS_FAILED);
            }
        }
        w.into_bytes()
    }

    /// Any status other than success counts as failure.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = FrameReader::new(bytes);
        let status = r.read_exact(STATUS_SUCCESS.len())?;
        if status != STATUS_SUCCESS {
            return Ok(Response::Failed);
        }
        let bytes_stored = r.read_int()?;
        let next_chunk = r.read_int()?;
        Ok(Response::Continue {
            bytes_stored,
            next_chunk,
        })
    }
}

/// Frame one chunk: claimed hash followed by the raw bytes.
pub fn encode_chunk(bytes: &[u8]) -> Vec<u8> {
    let mut w = FrameWriter::with_capacity(CHUNK_HASH_LEN as usize + bytes.len());
    w.write_i32(integrity::chunk_hash(bytes)).write_raw(bytes);
    w.into_bytes()
}

/// Split a chunk message into (claimed hash, bytes). Does not verify.
pub fn decode_chunk(msg: &[u8]) -> Result<(i32, &[u8])> {
    let mut r = FrameReader::new(msg);
    let claimed = r.read_i32()?;
    Ok((claimed, r.read_rest()))
}

/// Text clip as carried by a [`PayloadKind::Clip`] transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipPayload {
    pub mime_type: String,
    pub label: String,
    pub text: String,
}

impl ClipPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            label: String::new(),
            text: text.into(),
        }
    }

    /// Serialized blob; the transfer digest is computed over exactly these bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = FrameWriter::with_capacity(self.text.len() + 32);
        w.write_string(&self.mime_type)?;
        w.write_string(&self.label)?;
        w.write_string(&self.text)?;
        Ok(w.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = FrameReader::new(bytes);
        let mime_type = r.read_string()?;
        let label = r.read_string()?;
        let text = r.read_string()?;
        Ok(Self {
            mime_type,
            label,
            text,
        })
    }
}
