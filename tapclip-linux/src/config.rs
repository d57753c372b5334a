//! Load config from file and environment.

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;

/// Host configuration. File: ~/.config/tapclip/config.toml or /etc/tapclip/config.toml.
/// Env overrides: TAPCLIP_LISTEN, TAPCLIP_CONNECT, TAPCLIP_LINK_CAPACITY,
/// TAPCLIP_TAP_EXCHANGES, TAPCLIP_DOWNLOAD_DIR, TAPCLIP_CLIPBOARD_FILE, TAPCLIP_CACHE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the receiver accepts tap connections (default 127.0.0.1:47470).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Receiver address the sender dials.
    #[serde(default = "default_listen")]
    pub connect: String,
    /// Frame size the emulated link reports to the sender.
    #[serde(default = "default_link_capacity")]
    pub link_capacity: u32,
    /// Drop each sender connection after this many exchanges to emulate short taps.
    /// Zero keeps the connection until the transfer ends.
    #[serde(default)]
    pub tap_exchanges: u32,
    /// Delay between dial attempts while a send is armed.
    #[serde(default = "default_redial_ms")]
    pub redial_ms: u64,
    /// Received files land here.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Plain-text file standing in for the system clipboard.
    #[serde(default = "default_clipboard_file")]
    pub clipboard_file: PathBuf,
    /// Partial receives untouched this long are dropped.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub core: tapclip_core::Config,
}

fn default_listen() -> String {
    "127.0.0.1:47470".to_string()
}
fn default_link_capacity() -> u32 {
    1028
}
fn default_redial_ms() -> u64 {
    500
}
fn home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}
fn default_download_dir() -> PathBuf {
    home().join("Downloads")
}
fn default_clipboard_file() -> PathBuf {
    home().join(".local/share/tapclip/clipboard.txt")
}
fn default_stale_after_secs() -> u64 {
    7 * 24 * 3600
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            connect: default_listen(),
            link_capacity: default_link_capacity(),
            tap_exchanges: 0,
            redial_ms: default_redial_ms(),
            download_dir: default_download_dir(),
            clipboard_file: default_clipboard_file(),
            stale_after_secs: default_stale_after_secs(),
            log_filter: default_log_filter(),
            core: tapclip_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match load_file()? {
        Some(c) => c,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c.core.validate().context("invalid [core] settings")?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TAPCLIP_LISTEN") {
        c.listen = s;
    }
    if let Some(s) = var("TAPCLIP_CONNECT") {
        c.connect = s;
    }
    if let Some(s) = var("TAPCLIP_LINK_CAPACITY") {
        if let Ok(n) = s.parse::<u32>() {
            c.link_capacity = n;
        }
    }
    if let Some(s) = var("TAPCLIP_TAP_EXCHANGES") {
        if let Ok(n) = s.parse::<u32>() {
            c.tap_exchanges = n;
        }
    }
    if let Some(s) = var("TAPCLIP_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(s) = var("TAPCLIP_CLIPBOARD_FILE") {
        c.clipboard_file = PathBuf::from(s);
    }
    if let Some(s) = var("TAPCLIP_CACHE_DIR") {
        c.core.cache_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tapclip/config.toml"));
    }
    out.push(PathBuf::from("/etc/tapclip/config.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    for p in config_paths() {
        if p.exists() {
            let s = std::fs::read_to_string(&p)
                .with_context(|| format!("reading {}", p.display()))?;
            let c = toml::from_str::<Config>(&s)
                .with_context(|| format!("parsing {}", p.display()))?;
            return Ok(Some(c));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_with_core_table() {
        let c: Config = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"
            link_capacity = 261

            [core]
            watchdog_ticks = 5
            cache_dir = "/var/cache/tapclip"
            "#,
        )
        .unwrap();
        assert_eq!(c.listen, "0.0.0.0:9000");
        assert_eq!(c.connect, default_listen());
        assert_eq!(c.link_capacity, 261);
        assert_eq!(c.core.watchdog_ticks, 5);
        assert_eq!(c.core.hard_cap, 1024);
        assert_eq!(c.core.cache_dir, PathBuf::from("/var/cache/tapclip"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "TAPCLIP_CONNECT" => Some("10.0.0.2:47470".into()),
            "TAPCLIP_LINK_CAPACITY" => Some("not a number".into()),
            "TAPCLIP_CACHE_DIR" => Some("/tmp/tc".into()),
            "TAPCLIP_TAP_EXCHANGES" => Some("7".into()),
            _ => None,
        });
        assert_eq!(c.connect, "10.0.0.2:47470");
        assert_eq!(c.link_capacity, 1028);
        assert_eq!(c.core.cache_dir, PathBuf::from("/tmp/tc"));
        assert_eq!(c.tap_exchanges, 7);
    }
}
