//! Seams to the host: clipboard, notifications, the physical link, UI callbacks.
//! The core never does socket or UI work itself.

use std::io;
use std::path::Path;

use crate::error::LinkError;
use crate::protocol::ClipPayload;

/// Host clipboard. `read` feeds clip sends; `write` receives completed clips.
pub trait ClipboardAccess: Send + Sync {
    /// Current text clip, if the clipboard holds one.
    fn read(&self) -> Option<ClipPayload>;
    fn write(&self, mime_type: &str, label: &str, text: &str);
}

/// User-facing notifications for completed receives.
pub trait NotificationSink: Send + Sync {
    fn payload_received(&self, text: &str);
    /// A file is complete and verified at `staged`. The staged copy is deleted once
    /// this returns `Ok`, so the sink must copy or move it now. On `Err` the staged
    /// copy is kept and the next connection for the digest retries the hand-off.
    fn file_received(&self, file_name: &str, digest: &str, staged: &Path) -> io::Result<()>;
}

pub trait TransportCapability {
    /// Largest frame the link can carry in one exchange.
    fn max_frame_bytes(&self) -> u32;
}

/// One physical connection: blocking request/response exchanges.
pub trait Transport: TransportCapability {
    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError>;
}

/// Sender-side progress and completion, delivered on whatever thread the core runs on.
pub trait SendCallbacks: Send + Sync {
    /// Send accepted and waiting for the first connection.
    fn on_send_enabled(&self) {}
    /// Bytes acknowledged so far, or idle watchdog ticks while waiting.
    fn on_progress(&self, current: u32, max: u32);
    /// Called exactly once per session.
    fn on_send_complete(&self, succeeded: bool);
}
