//! Sender: serves exactly the chunk the receiver asks for, one exchange at a time.
//! A `Sender` lives for the whole transfer; every new physical connection starts
//! over with the handshake and lets the receiver say where to resume.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::chunk::{chunk_at, negotiate_chunk_len};
use crate::collab::{ClipboardAccess, Transport};
use crate::config::{Config, ConfigError};
use crate::error::{Result, TransferError};
use crate::integrity;
use crate::protocol::{self, ClipPayload, Handshake, PayloadHeader, PayloadKind, Response};

/// Bytes to send and where they come from.
#[derive(Debug)]
pub enum PayloadSource {
    /// Serialized [`ClipPayload`].
    Clip(Vec<u8>),
    File {
        path: PathBuf,
        name: String,
        len: u32,
    },
}

impl PayloadSource {
    pub fn from_clip(clip: &ClipPayload) -> Result<Self> {
        let blob = clip.encode()?;
        check_size(blob.len() as u64)?;
        Ok(PayloadSource::Clip(blob))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(TransferError::Invalid("not a regular file"));
        }
        let len = check_size(meta.len())?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(TransferError::Invalid("file name is not valid UTF-8"))?
            .to_string();
        Ok(PayloadSource::File {
            path: path.to_path_buf(),
            name,
            len,
        })
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadSource::Clip(_) => PayloadKind::Clip,
            PayloadSource::File { .. } => PayloadKind::File,
        }
    }

    pub fn total_size(&self) -> u32 {
        match self {
            PayloadSource::Clip(blob) => blob.len() as u32,
            PayloadSource::File { len, .. } => *len,
        }
    }

    fn file_name(&self) -> Option<String> {
        match self {
            PayloadSource::Clip(_) => None,
            PayloadSource::File { name, .. } => Some(name.clone()),
        }
    }

    fn digest(&self) -> io::Result<String> {
        match self {
            PayloadSource::Clip(blob) => Ok(integrity::digest_of(blob)),
            PayloadSource::File { path, .. } => integrity::digest_of_file(path),
        }
    }
}

fn check_size(len: u64) -> Result<u32> {
    u32::try_from(len).map_err(|_| TransferError::TooLarge { len })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderPhase {
    Idle,
    /// Armed and waiting for a link.
    AwaitingConnection,
    AwaitingResponse,
    /// A chunk is in flight.
    Continuing,
    Completed,
    Failed,
}

/// What to do after a response.
#[derive(Debug, PartialEq, Eq)]
pub enum SendStep {
    Send(Vec<u8>),
    Completed,
}

/// How one physical connection ended without failing the transfer.
#[derive(Debug)]
pub enum ConnectionEnd {
    Completed,
    /// Link dropped; a later connection resumes.
    Disconnected,
    /// This connection was abandoned but the transfer can still be resumed.
    Aborted(TransferError),
}

/// Hooks run once per successful round trip.
pub trait RoundTripObserver {
    fn round_trip(&self, bytes_acked: u32, total: u32);
    /// Checked before every exchange.
    fn cancelled(&self) -> bool {
        false
    }
}

impl RoundTripObserver for () {
    fn round_trip(&self, _: u32, _: u32) {}
}

pub struct Sender {
    handshake: Handshake,
    hard_cap: u32,
    source: PayloadSource,
    reader: Option<File>,
    digest: Option<String>,
    max_chunk_len: u32,
    bytes_acked: u32,
    phase: SenderPhase,
}

impl Sender {
    pub fn new(handshake: Handshake, hard_cap: u32, source: PayloadSource) -> Self {
        Self {
            handshake,
            hard_cap,
            source,
            reader: None,
            digest: None,
            max_chunk_len: 0,
            bytes_acked: 0,
            phase: SenderPhase::Idle,
        }
    }

    pub fn from_config(config: &Config, source: PayloadSource) -> Result<Self, ConfigError> {
        let handshake = Handshake::new(config.aid_bytes()?, config.min_version, config.max_version);
        Ok(Self::new(handshake, config.hard_cap, source))
    }

    /// Sender for whatever the clipboard currently holds; `None` when it's empty.
    pub fn for_clipboard(config: &Config, clipboard: &dyn ClipboardAccess) -> Result<Option<Self>> {
        let Some(clip) = clipboard.read() else {
            return Ok(None);
        };
        let source = PayloadSource::from_clip(&clip)?;
        Ok(Some(Self::from_config(config, source)?))
    }

    pub fn phase(&self) -> SenderPhase {
        self.phase
    }

    pub fn source(&self) -> &PayloadSource {
        &self.source
    }

    pub fn bytes_acked(&self) -> u32 {
        self.bytes_acked
    }

    /// Chunk length negotiated on the current connection; zero before the first one.
    pub fn max_chunk_len(&self) -> u32 {
        self.max_chunk_len
    }

    /// Ready to serve the next connection.
    pub fn arm(&mut self) {
        if self.phase == SenderPhase::Idle {
            self.phase = SenderPhase::AwaitingConnection;
        }
    }

    /// Digest of the payload, computed on first use.
    pub fn digest(&mut self) -> io::Result<&str> {
        if self.digest.is_none() {
            let d = self.source.digest()?;
            tracing::debug!(digest = %d, bytes = self.source.total_size(), "payload digest computed");
            self.digest = Some(d);
        }
        Ok(self.digest.as_deref().unwrap_or_default())
    }

    /// Start a connection: negotiate the chunk length for `capacity` and build the
    /// handshake + header message.
    pub fn begin_connection(&mut self, capacity: u32) -> Result<Vec<u8>> {
        if self.is_finished() {
            return Err(TransferError::Invalid("transfer already finished"));
        }
        let max_chunk_len =
            negotiate_chunk_len(capacity, self.hard_cap).ok_or(TransferError::FrameTooSmall { capacity })?;
        let digest = self.digest()?.to_string();
        let header = PayloadHeader {
            kind: self.source.kind(),
            total_size: self.source.total_size(),
            max_chunk_len,
            digest,
            file_name: self.source.file_name(),
        };
        let msg = protocol::encode_first_message(&self.handshake, &header)?;
        self.max_chunk_len = max_chunk_len;
        self.phase = SenderPhase::AwaitingResponse;
        Ok(msg)
    }

    /// Feed the receiver's response. Returns the next chunk message or completion.
    pub fn on_response(&mut self, bytes: &[u8]) -> Result<SendStep> {
        match Response::decode(bytes)? {
            Response::Failed => {
                self.phase = SenderPhase::Failed;
                Err(TransferError::Rejected)
            }
            Response::Continue {
                bytes_stored,
                next_chunk,
            } => {
                let total = self.source.total_size();
                self.bytes_acked = bytes_stored.min(total);
                if bytes_stored >= total {
                    self.phase = SenderPhase::Completed;
                    return Ok(SendStep::Completed);
                }
                let chunk = chunk_at(next_chunk, total, self.max_chunk_len)
                    .ok_or(TransferError::Invalid("peer requested a chunk past the end"))?;
                let bytes = self.read_range(chunk.start, chunk.len())?;
                tracing::trace!(index = next_chunk, len = bytes.len(), "sending chunk");
                self.phase = SenderPhase::Continuing;
                Ok(SendStep::Send(protocol::encode_chunk(&bytes)))
            }
        }
    }

    fn read_range(&mut self, start: u64, len: usize) -> io::Result<Vec<u8>> {
        match &self.source {
            PayloadSource::Clip(blob) => Ok(blob[start as usize..start as usize + len].to_vec()),
            PayloadSource::File { path, .. } => {
                if self.reader.is_none() {
                    self.reader = Some(File::open(path)?);
                }
                let Some(file) = self.reader.as_mut() else {
                    return Err(io::ErrorKind::NotFound.into());
                };
                file.seek(SeekFrom::Start(start))?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, SenderPhase::Completed | SenderPhase::Failed)
    }

    /// Drive one physical connection until it completes the transfer, drops, or the
    /// transfer fails. `Err` means the transfer is over; `Ok` variants leave it resumable
    /// unless `Completed`.
    pub fn run_connection<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        observer: &dyn RoundTripObserver,
    ) -> Result<ConnectionEnd> {
        if self.is_finished() {
            return Err(TransferError::Invalid("transfer already finished"));
        }
        let first = match self.begin_connection(transport.max_frame_bytes()) {
            Ok(msg) => msg,
            Err(e) => return self.connection_error(e),
        };
        let total = self.source.total_size();
        let mut outbound = first;
        let mut exchanges = 0u32;
        loop {
            if observer.cancelled() {
                self.phase = SenderPhase::Failed;
                return Err(TransferError::Cancelled);
            }
            let reply = match transport.exchange(&outbound) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!(error = %e, exchanges, acked = self.bytes_acked, "link dropped");
                    self.phase = SenderPhase::AwaitingConnection;
                    return Ok(ConnectionEnd::Disconnected);
                }
            };
            exchanges += 1;
            match self.on_response(&reply) {
                Ok(SendStep::Completed) => {
                    observer.round_trip(self.bytes_acked, total);
                    tracing::info!(bytes = total, exchanges, "send complete");
                    return Ok(ConnectionEnd::Completed);
                }
                Ok(SendStep::Send(next)) => {
                    observer.round_trip(self.bytes_acked, total);
                    outbound = next;
                }
                Err(e) => return self.connection_error(e),
            }
        }
    }

    fn connection_error(&mut self, e: TransferError) -> Result<ConnectionEnd> {
        if ends_transfer(&e) {
            self.phase = SenderPhase::Failed;
            Err(e)
        } else {
            tracing::warn!(error = %e, "abandoning connection");
            self.phase = SenderPhase::AwaitingConnection;
            Ok(ConnectionEnd::Aborted(e))
        }
    }
}

/// Errors no later connection can recover from.
fn ends_transfer(e: &TransferError) -> bool {
    matches!(
        e,
        TransferError::Rejected
            | TransferError::Storage(_)
            | TransferError::TooLarge { .. }
            | TransferError::Cancelled
            | TransferError::Config(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::collab::TransportCapability;
    use crate::protocol::{STATUS_FAILED, MAGIC};
    use crate::wire::FrameReader;
    use std::cell::Cell;

    fn handshake() -> Handshake {
        Handshake::new(vec![0xF0, 0x74, 0x61, 0x70, 0x63, 0xC1], 1, 1)
    }

    fn cont(bytes_stored: u32, next_chunk: u32) -> Vec<u8> {
        Response::Continue {
            bytes_stored,
            next_chunk,
        }
        .encode()
    }

    fn clip_sender(text: &str) -> Sender {
        Sender::new(
            handshake(),
            1024,
            PayloadSource::from_clip(&ClipPayload::text(text)).unwrap(),
        )
    }

    #[test]
    fn first_message_carries_negotiated_header() {
        let mut s = clip_sender("hello");
        s.arm();
        assert_eq!(s.phase(), SenderPhase::AwaitingConnection);
        let msg = s.begin_connection(65_279).unwrap();
        assert_eq!(&msg[..4], &MAGIC);
        let mut r = FrameReader::new(&msg);
        Handshake::read_and_validate(&mut r, &handshake().aid, 1).unwrap();
        let header = PayloadHeader::read(&mut r).unwrap();
        assert_eq!(header.kind, PayloadKind::Clip);
        assert_eq!(header.max_chunk_len, 1020);
        assert_eq!(header.total_size, s.source().total_size());
        assert_eq!(s.phase(), SenderPhase::AwaitingResponse);
    }

    #[test]
    fn serves_requested_chunk_only() {
        let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let mut s = Sender::new(handshake(), 1024, PayloadSource::Clip(data.clone()));
        s.begin_connection(1004).unwrap();
        assert_eq!(s.max_chunk_len(), 1000);
        let SendStep::Send(msg) = s.on_response(&cont(2000, 2)).unwrap() else {
            panic!("expected a chunk");
        };
        let (hash, body) = protocol::decode_chunk(&msg).unwrap();
        assert_eq!(body, &data[2000..]);
        assert_eq!(hash, integrity::chunk_hash(body));
        assert_eq!(s.bytes_acked(), 2000);
        assert_eq!(s.phase(), SenderPhase::Continuing);
        assert_eq!(s.on_response(&cont(3000, 3)).unwrap(), SendStep::Completed);
        assert_eq!(s.phase(), SenderPhase::Completed);
    }

    #[test]
    fn failure_status_is_terminal() {
        let mut s = clip_sender("x");
        s.begin_connection(1028).unwrap();
        assert!(matches!(
            s.on_response(&STATUS_FAILED),
            Err(TransferError::Rejected)
        ));
        assert_eq!(s.phase(), SenderPhase::Failed);
        assert!(s.begin_connection(1028).is_err());
    }

    #[test]
    fn request_past_end_is_invalid() {
        let mut s = clip_sender("abc");
        s.begin_connection(1028).unwrap();
        let err = s.on_response(&cont(0, 7)).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn tiny_frame_refused() {
        let mut s = clip_sender("abc");
        assert!(matches!(
            s.begin_connection(4),
            Err(TransferError::FrameTooSmall { capacity: 4 })
        ));
    }

    #[test]
    fn file_source_reads_ranges_from_disk() {
        let path = std::env::temp_dir().join(format!("tapclip-send-{}.bin", uuid::Uuid::new_v4()));
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let source = PayloadSource::from_file(&path).unwrap();
        assert_eq!(source.kind(), PayloadKind::File);
        assert_eq!(source.total_size(), 2500);
        let mut s = Sender::new(handshake(), 1028, source);
        assert_eq!(s.digest().unwrap(), integrity::digest_of(&data));
        s.begin_connection(1028).unwrap();
        assert_eq!(s.max_chunk_len(), 1024);
        let SendStep::Send(msg) = s.on_response(&cont(2048, 2)).unwrap() else {
            panic!("expected a chunk");
        };
        assert_eq!(protocol::decode_chunk(&msg).unwrap().1, &data[2048..]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn directory_is_not_a_file_source() {
        assert!(PayloadSource::from_file(std::env::temp_dir()).is_err());
    }

    struct Scripted {
        replies: Vec<Result<Vec<u8>, LinkError>>,
        sent: Vec<Vec<u8>>,
    }

    impl TransportCapability for Scripted {
        fn max_frame_bytes(&self) -> u32 {
            8
        }
    }

    impl Transport for Scripted {
        fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError> {
            self.sent.push(frame.to_vec());
            if self.replies.is_empty() {
                return Err(LinkError::ConnectionLost);
            }
            self.replies.remove(0)
        }
    }

    struct Counter(Cell<u32>);

    impl RoundTripObserver for Counter {
        fn round_trip(&self, _: u32, _: u32) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn connection_drop_leaves_transfer_resumable() {
        let data = b"0123456789".to_vec();
        let mut s = Sender::new(handshake(), 1024, PayloadSource::Clip(data));
        let mut link = Scripted {
            replies: vec![Ok(cont(0, 0)), Ok(cont(4, 1))],
            sent: Vec::new(),
        };
        let seen = Counter(Cell::new(0));
        let end = s.run_connection(&mut link, &seen).unwrap();
        assert!(matches!(end, ConnectionEnd::Disconnected));
        assert_eq!(seen.0.get(), 2);
        assert_eq!(link.sent.len(), 3);
        assert_eq!(s.bytes_acked(), 4);
        assert_eq!(s.phase(), SenderPhase::AwaitingConnection);

        let mut link = Scripted {
            replies: vec![Ok(cont(8, 2)), Ok(cont(10, 3))],
            sent: Vec::new(),
        };
        let end = s.run_connection(&mut link, &()).unwrap();
        assert!(matches!(end, ConnectionEnd::Completed));
        assert_eq!(protocol::decode_chunk(&link.sent[1]).unwrap().1, b"89");
    }

    #[test]
    fn garbage_reply_aborts_only_the_connection() {
        let mut s = clip_sender("hello");
        let mut link = Scripted {
            replies: vec![Ok(vec![0x90])],
            sent: Vec::new(),
        };
        let end = s.run_connection(&mut link, &()).unwrap();
        assert!(matches!(end, ConnectionEnd::Aborted(ref e) if e.is_malformed()));
        assert!(!s.is_finished());
    }
}
