//! Receiver: one instance per physical connection. The host feeds it each inbound
//! frame and sends back whatever it returns.
//!
//! Flow:
//!   1. First frame: validate handshake, read header, open or resume the chunk store
//!      for the digest, answer with the resume point.
//!   2. Each later frame: check the chunk hash, store at the sought offset, answer
//!      with the next chunk wanted.
//!   3. Once every byte is stored: verify the digest, hand the payload to the
//!      clipboard or notification sink, release the store.

use std::path::PathBuf;
use std::sync::Arc;

use crate::collab::{ClipboardAccess, NotificationSink};
use crate::config::{Config, ConfigError};
use crate::error::{Result, TransferError};
use crate::integrity;
use crate::protocol::{self, ClipPayload, Handshake, PayloadHeader, PayloadKind, Response};
use crate::store::{SharedStore, StoreRegistry};
use crate::wire::FrameReader;

/// Everything a receiver needs that outlives a single connection.
pub struct ReceiverContext {
    aid: Vec<u8>,
    local_version: u8,
    stores: Arc<StoreRegistry>,
    clipboard: Arc<dyn ClipboardAccess>,
    notify: Arc<dyn NotificationSink>,
}

impl ReceiverContext {
    pub fn new(
        config: &Config,
        stores: Arc<StoreRegistry>,
        clipboard: Arc<dyn ClipboardAccess>,
        notify: Arc<dyn NotificationSink>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            aid: config.aid_bytes()?,
            local_version: config.local_version,
            stores,
            clipboard,
            notify,
        })
    }

    pub fn stores(&self) -> &Arc<StoreRegistry> {
        &self.stores
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverPhase {
    /// Waiting for the handshake + header.
    Connecting,
    AwaitingFirstChunk,
    AwaitingChunk,
    Verifying,
    Delivered,
    Failed,
}

struct Active {
    header: PayloadHeader,
    store: SharedStore,
}

pub struct Receiver {
    ctx: Arc<ReceiverContext>,
    phase: ReceiverPhase,
    active: Option<Active>,
    chunks_this_connection: u32,
}

impl Receiver {
    pub fn new(ctx: Arc<ReceiverContext>) -> Self {
        Self {
            ctx,
            phase: ReceiverPhase::Connecting,
            active: None,
            chunks_this_connection: 0,
        }
    }

    pub fn phase(&self) -> ReceiverPhase {
        self.phase
    }

    pub fn header(&self) -> Option<&PayloadHeader> {
        self.active.as_ref().map(|a| &a.header)
    }

    /// Handle one inbound frame and produce the response frame. Every error becomes
    /// a failure status here; nothing below this call leaks to the host.
    pub fn process(&mut self, frame: &[u8]) -> Vec<u8> {
        match self.handle(frame) {
            Ok(resp) => resp.encode(),
            Err(e) => {
                match &e {
                    TransferError::ChunkIntegrityMismatch { .. } => {
                        tracing::warn!(error = %e, "rejecting corrupt chunk")
                    }
                    TransferError::ProtocolMismatch(_) => {
                        tracing::info!(error = %e, "refusing connection")
                    }
                    _ => tracing::warn!(error = %e, phase = ?self.phase, "receive failed"),
                }
                Response::Failed.encode()
            }
        }
    }

    /// Same as [`Receiver::process`] but with the typed outcome.
    pub fn handle(&mut self, frame: &[u8]) -> Result<Response> {
        match self.phase {
            ReceiverPhase::Connecting => self.on_first(frame),
            ReceiverPhase::AwaitingFirstChunk | ReceiverPhase::AwaitingChunk => {
                self.on_chunk(frame)
            }
            ReceiverPhase::Verifying | ReceiverPhase::Delivered | ReceiverPhase::Failed => {
                Err(TransferError::Invalid("transfer already finished"))
            }
        }
    }

    fn on_first(&mut self, frame: &[u8]) -> Result<Response> {
        let mut r = FrameReader::new(frame);
        if let Err(e) = Handshake::read_and_validate(&mut r, &self.ctx.aid, self.ctx.local_version) {
            // A peer we can't talk to gets no second try on this connection.
            if matches!(e, TransferError::ProtocolMismatch(_)) {
                self.phase = ReceiverPhase::Failed;
            }
            return Err(e);
        }
        let header = PayloadHeader::read(&mut r)?;
        let store = self.ctx.stores.open_or_create(&header)?;
        tracing::debug!(
            kind = ?header.kind,
            total = header.total_size,
            max_chunk_len = header.max_chunk_len,
            digest = %header.digest,
            "transfer header received"
        );
        self.active = Some(Active { header, store });
        self.phase = ReceiverPhase::AwaitingFirstChunk;
        self.progress()
    }

    fn on_chunk(&mut self, frame: &[u8]) -> Result<Response> {
        let active = self
            .active
            .as_ref()
            .ok_or(TransferError::Invalid("chunk before header"))?;
        let (claimed, bytes) = protocol::decode_chunk(frame)?;
        let mut store = active.store.lock();
        let index = store.next_chunk_sought();
        let actual = integrity::chunk_hash(bytes);
        if actual != claimed {
            return Err(TransferError::ChunkIntegrityMismatch {
                index,
                claimed,
                actual,
            });
        }
        store.store(index, bytes)?;
        drop(store);
        self.chunks_this_connection += 1;
        self.phase = ReceiverPhase::AwaitingChunk;
        self.progress()
    }

    /// Report the resume point; verify and deliver once everything is stored.
    fn progress(&mut self) -> Result<Response> {
        let active = self
            .active
            .as_ref()
            .ok_or(TransferError::Invalid("no active transfer"))?;
        let (bytes_stored, next_chunk, complete) = {
            let store = active.store.lock();
            (
                store.bytes_stored(),
                store.next_chunk_sought(),
                store.is_complete(),
            )
        };
        if complete {
            self.phase = ReceiverPhase::Verifying;
            match self.deliver() {
                Ok(()) => self.phase = ReceiverPhase::Delivered,
                Err(e) => {
                    self.phase = ReceiverPhase::Failed;
                    return Err(e);
                }
            }
        } else {
            tracing::trace!(bytes_stored, next_chunk, "requesting chunk");
        }
        Ok(Response::Continue {
            bytes_stored,
            next_chunk,
        })
    }

    fn deliver(&self) -> Result<()> {
        let Some(active) = self.active.as_ref() else {
            return Err(TransferError::Invalid("no active transfer"));
        };
        let digest = active.header.digest.clone();
        let mut store = active.store.lock();
        if !store.verify() {
            drop(store);
            if let Err(e) = self.ctx.stores.discard(&digest) {
                tracing::warn!(%digest, error = %e, "could not remove staged payload");
            }
            return Err(TransferError::PayloadIntegrityMismatch { digest });
        }
        match active.header.kind {
            PayloadKind::Clip => {
                let blob = store.contents();
                drop(store);
                let clip = match blob.map_err(TransferError::from).and_then(|b| ClipPayload::decode(&b)) {
                    Ok(clip) => clip,
                    Err(e) => {
                        if let Err(e) = self.ctx.stores.discard(&digest) {
                            tracing::warn!(%digest, error = %e, "could not remove staged payload");
                        }
                        return Err(e);
                    }
                };
                self.ctx
                    .clipboard
                    .write(&clip.mime_type, &clip.label, &clip.text);
                self.ctx.notify.payload_received(&clip.text);
                tracing::info!(%digest, chars = clip.text.chars().count(), "clip received");
            }
            PayloadKind::File => {
                let staged: Option<PathBuf> = store.staged_path().map(PathBuf::from);
                drop(store);
                let staged = staged.ok_or(TransferError::Invalid("file payload not staged on disk"))?;
                let name = active.header.file_name.as_deref().unwrap_or_default();
                if let Err(e) = self.ctx.notify.file_received(name, &digest, &staged) {
                    tracing::error!(%digest, file = name, error = %e, "hand-off failed; keeping staged file");
                    return Err(e.into());
                }
                tracing::info!(%digest, file = name, bytes = active.header.total_size, "file received");
            }
        }
        if let Err(e) = self.ctx.stores.release(&digest) {
            tracing::warn!(%digest, error = %e, "could not release staged payload");
        }
        Ok(())
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            if !matches!(self.phase, ReceiverPhase::Delivered | ReceiverPhase::Failed) {
                tracing::debug!(
                    digest = %active.header.digest,
                    chunks = self.chunks_this_connection,
                    "connection ended mid-transfer; store kept for resume"
                );
            }
        }
    }
}
