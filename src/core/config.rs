//! Centralized configuration for peerbeam.
//!
//! Protocol constants live at the top so both peers agree on them. The
//! user-tunable part (`Settings`) is loaded from TOML and handed explicitly
//! to the components that need it; nothing here is global mutable state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Size of one binary frame on a file channel (50 KiB).
pub const CHUNK_SIZE: usize = 50 * 1024;

/// Sender keeps reading while the channel's buffered amount is at or below
/// this value, and otherwise waits for the low-buffer signal.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = CHUNK_SIZE * 5;

/// Data channels carrying file `i` are labelled `file:i`.
pub const FILE_CHANNEL_PREFIX: &str = "file:";

/// Suffix for partially received files; renamed away on finalize.
pub const PART_FILE_SUFFIX: &str = ".peerbeam-part";

/// How long a session waits for in-flight file workers to report after the
/// peer connection dropped. A worker that already finished its file still
/// counts as done.
pub const INTERRUPTION_GRACE: Duration = Duration::from_secs(2);

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Bound on reaching "connected" once ICE gathering reports complete.
pub const ICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Label of the throwaway channel the caller opens to start ICE gathering.
pub const PROBE_CHANNEL_LABEL: &str = "probe";

/// Capacity of the per-connection transport event fan-out.
pub const TRANSPORT_EVENT_CAPACITY: usize = 1024;

// ── Pairing ──────────────────────────────────────────────────────────────────

/// Validity window of a pairing code.
pub const PAIRING_CODE_TTL: Duration = Duration::from_secs(5 * 60);

/// Number of characters in a generated pairing code.
pub const PAIRING_CODE_LENGTH: usize = 4;

/// Characters a pairing code is drawn from.
pub const PAIRING_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Channel label for file `index`.
pub fn file_channel_label(index: usize) -> String {
    format!("{FILE_CHANNEL_PREFIX}{index}")
}

/// Inverse of [`file_channel_label`]. Returns `None` for any other label.
pub fn parse_file_channel_label(label: &str) -> Option<usize> {
    label.strip_prefix(FILE_CHANNEL_PREFIX)?.parse().ok()
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// One STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// User-tunable settings, usually read from `peerbeam.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ice_servers: Vec<IceServerConfig>,
    /// Gather loopback candidates too. Needed when both peers run on one host.
    pub include_loopback_candidates: bool,
    pub connect_timeout_secs: u64,
    pub pairing_code_ttl_secs: u64,
    pub download_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: String::new(),
                credential: String::new(),
            }],
            include_loopback_candidates: false,
            connect_timeout_secs: ICE_CONNECT_TIMEOUT.as_secs(),
            pairing_code_ttl_secs: PAIRING_CODE_TTL.as_secs(),
            download_dir: default_download_dir(),
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pairing_code_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_code_ttl_secs)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid settings file")
    }

    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerbeam")
}
