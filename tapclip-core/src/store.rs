//! Chunk store: resumable receive buffers keyed by payload digest.
//!
//! Clip payloads are staged in memory and survive reconnects within one process.
//! File payloads are staged in `<cache_dir>/<digest>.part`, next to a bincode
//! sidecar `<digest>.meta`; the part file's length is the resume point, so a file
//! transfer also survives a process restart.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chunk::chunk_at;
use crate::error::{Result, TransferError};
use crate::integrity;
use crate::protocol::{PayloadHeader, PayloadKind};

const PART_EXT: &str = "part";
const META_EXT: &str = "meta";

/// Persisted alongside each on-disk partial file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StagedMeta {
    digest: String,
    file_name: String,
    total_size: u32,
    max_chunk_len: u32,
}

enum Backing {
    Memory(Vec<u8>),
    Disk {
        file: File,
        part: PathBuf,
        meta: PathBuf,
    },
}

/// Accumulated bytes for one digest. Bytes are always a contiguous prefix of the payload.
pub struct ChunkStore {
    digest: String,
    kind: PayloadKind,
    file_name: Option<String>,
    total_size: u32,
    max_chunk_len: u32,
    bytes_stored: u32,
    backing: Backing,
    touched: SystemTime,
}

impl ChunkStore {
    fn in_memory(header: &PayloadHeader) -> Self {
        Self {
            digest: header.digest.clone(),
            kind: header.kind,
            file_name: header.file_name.clone(),
            total_size: header.total_size,
            max_chunk_len: header.max_chunk_len,
            bytes_stored: 0,
            backing: Backing::Memory(Vec::new()),
            touched: SystemTime::now(),
        }
    }

    /// Open `<dir>/<digest>.part`, creating it empty if absent. An existing file's
    /// length (rounded down to a whole chunk) becomes the resume point.
    fn on_disk(dir: &Path, meta: StagedMeta) -> io::Result<Self> {
        let part = dir.join(format!("{}.{PART_EXT}", meta.digest));
        let meta_path = dir.join(format!("{}.{META_EXT}", meta.digest));
        write_meta(&meta_path, &meta)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part)?;
        let on_disk = file.metadata()?;
        let touched = on_disk.modified().unwrap_or_else(|_| SystemTime::now());
        let mut store = Self {
            digest: meta.digest,
            kind: PayloadKind::File,
            file_name: Some(meta.file_name),
            total_size: meta.total_size,
            max_chunk_len: meta.max_chunk_len,
            bytes_stored: 0,
            backing: Backing::Disk {
                file,
                part,
                meta: meta_path,
            },
            touched,
        };
        let len = on_disk.len();
        let resume = if len > u64::from(store.total_size) {
            0
        } else {
            store.whole_chunk_prefix(len as u32)
        };
        if u64::from(resume) != len {
            store.truncate_to(resume)?;
        }
        store.bytes_stored = resume;
        Ok(store)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn max_chunk_len(&self) -> u32 {
        self.max_chunk_len
    }

    /// Durably stored contiguous bytes.
    pub fn bytes_stored(&self) -> u32 {
        self.bytes_stored
    }

    /// Next sequential chunk the store wants.
    pub fn next_chunk_sought(&self) -> u32 {
        self.bytes_stored / self.max_chunk_len
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_stored == self.total_size
    }

    /// Path of the staged bytes for file payloads.
    pub fn staged_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Disk { part, .. } => Some(part.as_path()),
            Backing::Memory(_) => None,
        }
    }

    pub fn idle_for(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.touched)
            .unwrap_or_default()
    }

    /// Bring an existing store in line with a new connection's header. A changed
    /// chunk length rounds the resume point down to a multiple of the new length so
    /// `index * max_chunk_len` on the sender still lands on stored boundaries.
    fn adopt(&mut self, header: &PayloadHeader) -> io::Result<()> {
        if header.total_size != self.total_size {
            tracing::warn!(
                digest = %self.digest,
                old = self.total_size,
                new = header.total_size,
                "size changed for known digest, restarting"
            );
            self.total_size = header.total_size;
            self.truncate_to(0)?;
        }
        if header.max_chunk_len != self.max_chunk_len {
            self.max_chunk_len = header.max_chunk_len;
            let resume = self.whole_chunk_prefix(self.bytes_stored);
            tracing::debug!(
                digest = %self.digest,
                max_chunk_len = self.max_chunk_len,
                resume,
                "chunk length renegotiated"
            );
            self.truncate_to(resume)?;
        }
        if let Some(name) = &header.file_name {
            self.file_name = Some(name.clone());
        }
        if let Backing::Disk { meta, .. } = &self.backing {
            write_meta(meta, &self.meta())?;
        }
        self.touched = SystemTime::now();
        Ok(())
    }

    /// Write chunk `index` at `index * max_chunk_len`. Re-storing an earlier chunk
    /// overwrites in place and does not change `bytes_stored`; skipping ahead of the
    /// sought chunk is an error.
    pub fn store(&mut self, index: u32, bytes: &[u8]) -> Result<u32> {
        let sought = self.next_chunk_sought();
        if index > sought {
            return Err(TransferError::OutOfSequence { index, sought });
        }
        let chunk = chunk_at(index, self.total_size, self.max_chunk_len)
            .ok_or(TransferError::Invalid("chunk index past end of payload"))?;
        if bytes.len() != chunk.len() {
            return Err(TransferError::Invalid("chunk length does not match header"));
        }
        match &mut self.backing {
            Backing::Memory(buf) => {
                let (start, end) = (chunk.start as usize, chunk.end as usize);
                if buf.len() >= end {
                    buf[start..end].copy_from_slice(bytes);
                } else {
                    buf.truncate(start);
                    buf.extend_from_slice(bytes);
                }
            }
            Backing::Disk { file, .. } => {
                file.seek(SeekFrom::Start(chunk.start))?;
                file.write_all(bytes)?;
                file.sync_data()?;
            }
        }
        self.bytes_stored = self.bytes_stored.max(chunk.end as u32);
        self.touched = SystemTime::now();
        tracing::trace!(digest = %self.digest, index, stored = self.bytes_stored, "chunk stored");
        Ok(self.bytes_stored)
    }

    /// Whole payload present and matching the digest. I/O errors read as a mismatch.
    pub fn verify(&mut self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let actual = match &mut self.backing {
            Backing::Memory(buf) => Ok(integrity::digest_of(buf)),
            Backing::Disk { file, .. } => file
                .seek(SeekFrom::Start(0))
                .and_then(|_| integrity::digest_of_reader(&mut *file)),
        };
        match actual {
            Ok(actual) => actual == self.digest,
            Err(e) => {
                tracing::warn!(digest = %self.digest, error = %e, "digest read failed");
                false
            }
        }
    }

    /// Stored bytes, read back in full.
    pub fn contents(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.backing {
            Backing::Memory(buf) => Ok(buf.clone()),
            Backing::Disk { file, .. } => {
                let mut out = Vec::with_capacity(self.bytes_stored as usize);
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    fn whole_chunk_prefix(&self, len: u32) -> u32 {
        if len == self.total_size {
            len
        } else {
            len - len % self.max_chunk_len
        }
    }

    fn truncate_to(&mut self, len: u32) -> io::Result<()> {
        match &mut self.backing {
            Backing::Memory(buf) => buf.truncate(len as usize),
            Backing::Disk { file, .. } => {
                file.set_len(u64::from(len))?;
                file.sync_data()?;
            }
        }
        self.bytes_stored = len;
        Ok(())
    }

    fn meta(&self) -> StagedMeta {
        StagedMeta {
            digest: self.digest.clone(),
            file_name: self.file_name.clone().unwrap_or_default(),
            total_size: self.total_size,
            max_chunk_len: self.max_chunk_len,
        }
    }

    fn remove_files(&mut self) -> io::Result<()> {
        match &mut self.backing {
            Backing::Memory(buf) => {
                buf.clear();
                Ok(())
            }
            Backing::Disk { part, meta, .. } => {
                remove_if_present(part)?;
                remove_if_present(meta)
            }
        }
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("digest", &self.digest)
            .field("kind", &self.kind)
            .field("bytes_stored", &self.bytes_stored)
            .field("total_size", &self.total_size)
            .field("max_chunk_len", &self.max_chunk_len)
            .finish()
    }
}

pub type SharedStore = Arc<Mutex<ChunkStore>>;

/// Snapshot of an unfinished receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub digest: String,
    pub kind: PayloadKind,
    pub file_name: Option<String>,
    pub bytes_stored: u32,
    pub total_size: u32,
}

/// Process-wide map of chunk stores. Outlives every connection; that is what lets a
/// later connection presenting the same digest resume.
pub struct StoreRegistry {
    dir: PathBuf,
    stores: Mutex<HashMap<String, SharedStore>>,
}

impl StoreRegistry {
    /// Open the registry over `dir`, creating it if needed, and re-index partial files
    /// left by an earlier process.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let registry = Self {
            dir,
            stores: Mutex::new(HashMap::new()),
        };
        registry.recover()?;
        Ok(registry)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store for `header.digest`, reusing an existing one (the resume case).
    pub fn open_or_create(&self, header: &PayloadHeader) -> io::Result<SharedStore> {
        let mut stores = self.stores.lock();
        if let Some(existing) = stores.get(&header.digest) {
            let shared = existing.clone();
            let mut store = shared.lock();
            if store.kind == header.kind {
                store.adopt(header)?;
                tracing::info!(
                    digest = %header.digest,
                    bytes_stored = store.bytes_stored(),
                    total = store.total_size(),
                    "resuming receive"
                );
                drop(store);
                return Ok(shared);
            }
            // Same digest, different kind: start this one afresh.
            store.remove_files()?;
        }
        let store = match header.kind {
            PayloadKind::Clip => ChunkStore::in_memory(header),
            PayloadKind::File => ChunkStore::on_disk(
                &self.dir,
                StagedMeta {
                    digest: header.digest.clone(),
                    file_name: header.file_name.clone().unwrap_or_default(),
                    total_size: header.total_size,
                    max_chunk_len: header.max_chunk_len,
                },
            )?,
        };
        if store.bytes_stored() > 0 {
            tracing::info!(
                digest = %header.digest,
                bytes_stored = store.bytes_stored(),
                "resuming receive from staged file"
            );
        }
        let shared = Arc::new(Mutex::new(store));
        stores.insert(header.digest.clone(), shared.clone());
        Ok(shared)
    }

    pub fn get(&self, digest: &str) -> Option<SharedStore> {
        self.stores.lock().get(digest).cloned()
    }

    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.lock().is_empty()
    }

    /// Forget a delivered payload and delete its staged bytes.
    pub fn release(&self, digest: &str) -> io::Result<()> {
        self.remove(digest)
    }

    /// Drop a payload whose reassembled bytes failed verification, so the next
    /// attempt starts from zero.
    pub fn discard(&self, digest: &str) -> io::Result<()> {
        tracing::warn!(digest, "discarding staged payload");
        self.remove(digest)
    }

    fn remove(&self, digest: &str) -> io::Result<()> {
        // Registry lock is released before touching the store.
        let removed = self.stores.lock().remove(digest);
        match removed {
            Some(store) => store.lock().remove_files(),
            None => Ok(()),
        }
    }

    pub fn pending(&self) -> Vec<PendingTransfer> {
        let stores = self.stores.lock();
        let mut out: Vec<PendingTransfer> = stores
            .values()
            .map(|s| {
                let s = s.lock();
                PendingTransfer {
                    digest: s.digest.clone(),
                    kind: s.kind,
                    file_name: s.file_name.clone(),
                    bytes_stored: s.bytes_stored,
                    total_size: s.total_size,
                }
            })
            .collect();
        out.sort_by(|a, b| a.digest.cmp(&b.digest));
        out
    }

    /// Drop stores untouched for longer than `max_idle`. Returns how many went.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .stores
            .lock()
            .iter()
            .filter(|(_, s)| s.lock().idle_for() > max_idle)
            .map(|(d, _)| d.clone())
            .collect();
        let mut evicted = 0;
        for digest in stale {
            match self.remove(&digest) {
                Ok(()) => evicted += 1,
                Err(e) => tracing::warn!(%digest, error = %e, "eviction failed"),
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "evicted idle receives");
        }
        evicted
    }

    fn recover(&self) -> io::Result<()> {
        let mut metas = Vec::new();
        let mut parts = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(META_EXT) => metas.push(path),
                Some(PART_EXT) => parts.push(path),
                _ => {}
            }
        }
        let mut stores = self.stores.lock();
        for meta_path in metas {
            let meta = match read_meta(&meta_path) {
                Ok(m) if stem_is(&meta_path, &m.digest) && m.max_chunk_len > 0 => m,
                _ => {
                    tracing::warn!(path = %meta_path.display(), "dropping unreadable staging metadata");
                    remove_if_present(&meta_path)?;
                    continue;
                }
            };
            let digest = meta.digest.clone();
            match ChunkStore::on_disk(&self.dir, meta) {
                Ok(store) => {
                    tracing::debug!(%digest, bytes_stored = store.bytes_stored(), "recovered staged file");
                    stores.insert(digest, Arc::new(Mutex::new(store)));
                }
                Err(e) => tracing::warn!(%digest, error = %e, "could not reopen staged file"),
            }
        }
        for part in parts {
            let known = part
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|d| stores.contains_key(d));
            if !known {
                remove_if_present(&part)?;
            }
        }
        Ok(())
    }
}

/// Copy a staged file into `dir` under `name`, prefixing `x` until the name is unused.
pub fn place_file(staged: &Path, dir: &Path, name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let mut name = name.to_string();
    loop {
        let candidate = dir.join(&name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut out) => {
                let copied = File::open(staged)
                    .and_then(|mut src| io::copy(&mut src, &mut out))
                    .and_then(|_| out.sync_all());
                if let Err(e) = copied {
                    let _ = fs::remove_file(&candidate);
                    return Err(e);
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => name = format!("x{name}"),
            Err(e) => return Err(e),
        }
    }
}

fn write_meta(path: &Path, meta: &StagedMeta) -> io::Result<()> {
    let bytes =
        bincode::serialize(meta).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, bytes)
}

fn read_meta(path: &Path) -> io::Result<StagedMeta> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn stem_is(path: &Path, digest: &str) -> bool {
    integrity::is_digest(digest) && path.file_stem().and_then(|s| s.to_str()) == Some(digest)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
