//! Protocol configuration shared by sender and receiver.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{DEFAULT_HARD_CAP, PROTOCOL_VERSION};

/// Application identifier both ends must agree on (hex in config files).
pub const DEFAULT_AID_HEX: &str = "F074617063C1";

/// Consecutive idle ticks before the watchdog fails a send.
pub const DEFAULT_WATCHDOG_TICKS: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Application identifier, hex encoded.
    #[serde(default = "default_aid")]
    pub aid: String,
    /// Lowest version the sender offers.
    #[serde(default = "default_version")]
    pub min_version: u8,
    /// Highest version the sender offers.
    #[serde(default = "default_version")]
    pub max_version: u8,
    /// Version the receiver speaks; must fall in the sender's range.
    #[serde(default = "default_version")]
    pub local_version: u8,
    /// Upper bound on frame bytes used per chunk message, whatever the transport claims.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: u32,
    #[serde(default = "default_watchdog_ticks")]
    pub watchdog_ticks: u32,
    /// Watchdog tick length in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Where partial receives are staged.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_aid() -> String {
    DEFAULT_AID_HEX.to_string()
}
fn default_version() -> u8 {
    PROTOCOL_VERSION
}
fn default_hard_cap() -> u32 {
    DEFAULT_HARD_CAP
}
fn default_watchdog_ticks() -> u32 {
    DEFAULT_WATCHDOG_TICKS
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("tapclip")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aid: default_aid(),
            min_version: default_version(),
            max_version: default_version(),
            local_version: default_version(),
            hard_cap: default_hard_cap(),
            watchdog_ticks: default_watchdog_ticks(),
            tick_ms: default_tick_ms(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl Config {
    /// Decoded AID bytes.
    pub fn aid_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let bytes = hex::decode(&self.aid).map_err(|_| ConfigError::AidNotHex(self.aid.clone()))?;
        if bytes.is_empty() || bytes.len() > u8::MAX as usize {
            return Err(ConfigError::AidLength(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Reject settings the protocol can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.aid_bytes()?;
        if self.min_version > self.max_version {
            return Err(ConfigError::VersionRange {
                min: self.min_version,
                max: self.max_version,
            });
        }
        if self.watchdog_ticks == 0 || self.tick_ms == 0 {
            return Err(ConfigError::Watchdog);
        }
        if crate::chunk::negotiate_chunk_len(self.hard_cap, self.hard_cap).is_none() {
            return Err(ConfigError::HardCap(self.hard_cap));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("aid {0:?} is not valid hex")]
    AidNotHex(String),
    #[error("aid must be 1..=255 bytes, got {0}")]
    AidLength(usize),
    #[error("min_version {min} exceeds max_version {max}")]
    VersionRange { min: u8, max: u8 },
    #[error("watchdog ticks and tick length must be non-zero")]
    Watchdog,
    #[error("hard_cap {0} leaves no room for chunk data")]
    HardCap(u32),
}
