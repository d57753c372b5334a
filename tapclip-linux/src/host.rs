//! Desktop stand-ins for the phone-side collaborators: a text file as clipboard,
//! a download folder for received files, log lines for progress.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tapclip_core::{place_file, ClipPayload, ClipboardAccess, NotificationSink, SendCallbacks};

pub struct FileClipboard {
    path: PathBuf,
}

impl FileClipboard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ClipboardAccess for FileClipboard {
    fn read(&self) -> Option<ClipPayload> {
        match fs::read_to_string(&self.path) {
            Ok(text) if !text.is_empty() => Some(ClipPayload::text(text)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "clipboard file unreadable");
                None
            }
        }
    }

    fn write(&self, mime_type: &str, label: &str, text: &str) {
        let written = match self.path.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
        .and_then(|()| fs::write(&self.path, text));
        match written {
            Ok(()) => tracing::debug!(mime_type, label, "clipboard updated"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "clipboard write failed"),
        }
    }
}

/// Moves received files into the download folder and logs what arrived.
pub struct DownloadSink {
    dir: PathBuf,
}

impl DownloadSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl NotificationSink for DownloadSink {
    fn payload_received(&self, text: &str) {
        let preview: String = text.chars().take(40).collect();
        tracing::info!(%preview, "clip received");
    }

    fn file_received(&self, file_name: &str, digest: &str, staged: &Path) -> io::Result<()> {
        let name = if file_name.is_empty() { digest } else { file_name };
        let path = place_file(staged, &self.dir, name)?;
        tracing::info!(path = %path.display(), "file saved");
        Ok(())
    }
}

/// Logs send progress.
pub struct LogProgress;

impl SendCallbacks for LogProgress {
    fn on_send_enabled(&self) {
        tracing::info!("ready to send; waiting for the receiver");
    }

    fn on_progress(&self, current: u32, max: u32) {
        tracing::debug!(current, max, "send progress");
    }

    fn on_send_complete(&self, succeeded: bool) {
        if succeeded {
            tracing::info!("send delivered");
        } else {
            tracing::warn!("send did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("tapclip-host-{}", std::process::id()))
    }

    #[test]
    fn clipboard_file_round_trip() {
        let dir = scratch().join("clip");
        let clip = FileClipboard::new(dir.join("clipboard.txt"));
        assert!(clip.read().is_none());
        clip.write("text/plain", "", "copied text");
        assert_eq!(clip.read().unwrap().text, "copied text");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn files_land_in_download_dir_without_clobbering() {
        let dir = scratch().join("dl");
        fs::create_dir_all(&dir).unwrap();
        let staged = dir.join("staged.part");
        fs::write(&staged, b"payload").unwrap();
        let out = dir.join("out");
        let sink = DownloadSink::new(out.clone());
        sink.file_received("a.txt", "d", &staged).unwrap();
        sink.file_received("a.txt", "d", &staged).unwrap();
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"payload");
        assert_eq!(fs::read(out.join("xa.txt")).unwrap(), b"payload");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unusable_download_dir_reports_error() {
        let dir = scratch().join("blocked");
        fs::create_dir_all(&dir).unwrap();
        let staged = dir.join("staged.part");
        fs::write(&staged, b"payload").unwrap();
        // A regular file where the download folder should be.
        let blocker = dir.join("downloads");
        fs::write(&blocker, b"").unwrap();
        let sink = DownloadSink::new(blocker);
        assert!(sink.file_received("a.txt", "d", &staged).is_err());
        assert!(staged.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn clipboard_write_into_blocked_parent_does_not_panic() {
        let dir = scratch().join("clip-blocked");
        fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let clip = FileClipboard::new(blocker.join("clipboard.txt"));
        clip.write("text/plain", "", "lost");
        assert!(clip.read().is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
