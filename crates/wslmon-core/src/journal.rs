//! Append-only, hash-chained, rotating event journal.
//!
//! The journal is the tamper-evidence anchor on each side. Every append
//! serialises the enriched record into its canonical form `P_i`, extends
//! the chain `H_i = SHA256(hex(H_{i-1}) || P_i)` starting from 64 zero hex
//! digits, and writes one line:
//!
//! ```text
//! {"event":P_i,"chainHash":"H_i"[,"hmac":"T_i"]}\n
//! ```
//!
//! A sidecar file `<log>.chainstate` (chain hex, next sequence, entries
//! since rotation as whitespace-separated tokens) is rewritten after every
//! append so that a restarted journal continues the chain instead of
//! resetting it. Segments rotate once they exceed the configured size; the
//! rotated segment keeps its chain and gains a `<rotated>.manifest` with
//! the final hash.
//!
//! Appends are fully serialised behind one mutex covering enrichment,
//! canonicalisation, chain update, file write, and sidecar rewrite. All
//! I/O failures surface as the single [`JournalError::Unavailable`] class;
//! a later successful append recovers by reopening the segment.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{EventError, EventRecord};
use crate::hexstr;

type HmacSha256 = Hmac<Sha256>;

/// The chain starting point: 64 zero hex digits.
pub const ZERO_CHAIN_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Default rotation threshold (5 MiB).
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 5 * 1024 * 1024;

/// Environment variable holding the HMAC key as a hex literal.
pub const HMAC_KEY_ENV: &str = "WSLMON_LOG_HMAC_KEY";

/// Environment variable holding a path to a file whose contents are the
/// HMAC key in hex.
pub const HMAC_KEY_FILE_ENV: &str = "WSLMON_LOG_HMAC_KEY_FILE";

/// Errors surfaced by journal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// Any I/O failure while opening, appending, rotating, or persisting
    /// chain state. Appending again after the condition clears recovers.
    #[error("journal unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
}

/// Options for opening a [`Journal`].
#[derive(Debug, Clone)]
pub struct JournalOptions {
    /// Path of the active segment file.
    pub path: PathBuf,
    /// Source substituted when a record leaves `source` empty.
    pub default_source: String,
    /// Rotation threshold checked after each flush.
    pub max_segment_bytes: u64,
    /// Optional key for the per-line authentication tag.
    pub hmac_key: Option<Vec<u8>>,
}

impl JournalOptions {
    /// Creates options with defaults: source `"wslmon"`, 5 MiB segments,
    /// HMAC key taken from the environment.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            default_source: "wslmon".to_string(),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            hmac_key: hmac_key_from_env(),
        }
    }

    /// Overrides the default source.
    #[must_use]
    pub fn default_source(mut self, source: impl Into<String>) -> Self {
        self.default_source = source.into();
        self
    }

    /// Overrides the rotation threshold.
    #[must_use]
    pub const fn max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets or clears the authentication key explicitly.
    #[must_use]
    pub fn hmac_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.hmac_key = key;
        self
    }
}

/// Loads the journal HMAC key from the environment.
///
/// `WSLMON_LOG_HMAC_KEY` takes the hex key literally;
/// `WSLMON_LOG_HMAC_KEY_FILE` names a file whose contents are the hex key.
/// Missing or malformed keys disable the tag without error.
#[must_use]
pub fn hmac_key_from_env() -> Option<Vec<u8>> {
    if let Ok(literal) = std::env::var(HMAC_KEY_ENV) {
        if let Ok(bytes) = hexstr::decode(&literal) {
            if !bytes.is_empty() {
                return Some(bytes);
            }
        }
    }
    if let Ok(path) = std::env::var(HMAC_KEY_FILE_ENV) {
        if path.is_empty() {
            return None;
        }
        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(bytes) = hexstr::decode(contents.trim()) {
                if !bytes.is_empty() {
                    return Some(bytes);
                }
            }
        }
    }
    None
}

/// Manifest written alongside a rotated segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationManifest {
    /// Chain hash of the last record in the rotated segment.
    pub final_chain_hash: String,
    /// Records appended to the segment since the previous rotation.
    pub entries: u64,
    /// Rotation instant, RFC-3339 UTC.
    pub rotated_at: String,
}

/// One parsed on-disk journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    /// The inner event record.
    pub event: EventRecord,
    /// Chain hash after this record.
    #[serde(rename = "chainHash")]
    pub chain_hash: String,
    /// Authentication tag, present only when a key was configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Parses a single journal line.
///
/// # Errors
///
/// Returns [`EventError::Malformed`] when the line is not a valid
/// journal record.
pub fn parse_line(line: &str) -> Result<JournalLine, EventError> {
    Ok(serde_json::from_str(line)?)
}

/// Reads a journal segment, dropping malformed lines.
///
/// # Errors
///
/// Returns [`JournalError::Unavailable`] when the file cannot be read at
/// all; individual bad lines are skipped.
pub fn read_journal_file(path: &Path) -> Result<Vec<JournalLine>, JournalError> {
    let contents = fs::read_to_string(path)?;
    let mut lines = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(parsed) => lines.push(parsed),
            Err(err) => {
                debug!(path = %path.display(), line = number + 1, %err, "skipping malformed journal line");
            },
        }
    }
    Ok(lines)
}

struct JournalInner {
    path: PathBuf,
    state_path: PathBuf,
    default_source: String,
    max_segment_bytes: u64,
    hmac_key: Option<Vec<u8>>,
    writer: Option<File>,
    segment_bytes: u64,
    chain_hash: String,
    next_sequence: u64,
    entries_since_rotation: u64,
}

/// The append-only hash-chained journal.
pub struct Journal {
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Opens (or continues) a journal at the configured path.
    ///
    /// The parent directory is created and, on POSIX, narrowed to 0750.
    /// Chain state is restored from the sidecar; an absent or malformed
    /// sidecar resets to the zero chain and sequence 1.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Unavailable`] when the directory or segment
    /// cannot be prepared.
    pub fn open(options: JournalOptions) -> Result<Self, JournalError> {
        let state_path = chain_state_path(&options.path);
        ensure_directory(&options.path)?;

        let mut inner = JournalInner {
            path: options.path,
            state_path,
            default_source: options.default_source,
            max_segment_bytes: options.max_segment_bytes,
            hmac_key: options.hmac_key,
            writer: None,
            segment_bytes: 0,
            chain_hash: ZERO_CHAIN_HASH.to_string(),
            next_sequence: 1,
            entries_since_rotation: 0,
        };
        inner.load_chain_state();
        inner.open_segment()?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Appends a record: enriches it, extends the chain, writes and flushes
    /// the line, rewrites the sidecar, and rotates when the segment exceeds
    /// its threshold.
    ///
    /// Returns the enriched record (assigned sequence and timestamp) so the
    /// caller can feed the same copy to the ring and the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Unavailable`] on any I/O failure. The next
    /// successful append recovers automatically.
    pub fn append(&self, record: &EventRecord) -> Result<EventRecord, JournalError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.append(record)
    }

    /// Rotates the current segment explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Unavailable`] when the new segment or its
    /// state cannot be written. Rotation of a fresh segment is a no-op
    /// beyond resetting state.
    pub fn rotate(&self) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.rotate()
    }

    /// Path of the active segment.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.path.clone()
    }

    /// Current chain head, as stored in the sidecar.
    #[must_use]
    pub fn chain_hash(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.chain_hash.clone()
    }
}

impl JournalInner {
    fn append(&mut self, record: &EventRecord) -> Result<EventRecord, JournalError> {
        if self.writer.is_none() {
            self.open_segment()?;
        }

        let mut enriched = record.clone();
        if enriched.sequence == 0 {
            enriched.sequence = self.next_sequence;
            self.next_sequence += 1;
        } else if enriched.sequence >= self.next_sequence {
            self.next_sequence = enriched.sequence + 1;
        }
        if enriched.timestamp_unset() {
            enriched.timestamp = Utc::now();
        }
        if enriched.source.is_empty() {
            enriched.source.clone_from(&self.default_source);
        }

        let payload = enriched.canonical_json();

        let mut hasher = Sha256::new();
        hasher.update(self.chain_hash.as_bytes());
        hasher.update(payload.as_bytes());
        let chain_hash = hex::encode(hasher.finalize());

        let mut line = String::with_capacity(payload.len() + 128);
        line.push_str("{\"event\":");
        line.push_str(&payload);
        line.push_str(",\"chainHash\":\"");
        line.push_str(&chain_hash);
        line.push('"');
        if let Some(key) = &self.hmac_key {
            let mut mac =
                HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(payload.as_bytes());
            line.push_str(",\"hmac\":\"");
            line.push_str(&hex::encode(mac.finalize().into_bytes()));
            line.push('"');
        }
        line.push_str("}\n");

        if let Err(err) = self.write_line(&line) {
            // Drop the handle so the next append reopens the segment.
            self.writer = None;
            return Err(err);
        }

        self.chain_hash = chain_hash;
        self.segment_bytes += line.len() as u64;
        self.entries_since_rotation += 1;
        self.persist_chain_state()?;

        if self.segment_bytes > self.max_segment_bytes {
            self.rotate()?;
        }
        Ok(enriched)
    }

    fn write_line(&mut self, line: &str) -> Result<(), JournalError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("journal segment not open"))?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.writer = None;

        let suffix = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let rotated = path_with_suffix(&self.path, &suffix);
        if let Err(err) = fs::rename(&self.path, &rotated) {
            // A fresh segment may not exist yet; rotation stays idempotent.
            warn!(path = %self.path.display(), %err, "segment rename failed during rotation");
        } else {
            let manifest = RotationManifest {
                final_chain_hash: self.chain_hash.clone(),
                entries: self.entries_since_rotation,
                rotated_at: crate::event::format_timestamp(Utc::now()),
            };
            let manifest_path = path_with_suffix(&rotated, "manifest");
            match serde_json::to_string_pretty(&manifest) {
                Ok(body) => {
                    if let Err(err) = fs::write(&manifest_path, body + "\n") {
                        warn!(path = %manifest_path.display(), %err, "manifest write failed");
                    }
                },
                Err(err) => {
                    warn!(%err, "manifest serialisation failed");
                },
            }
            debug!(rotated = %rotated.display(), entries = self.entries_since_rotation, "journal segment rotated");
        }

        self.chain_hash = ZERO_CHAIN_HASH.to_string();
        self.entries_since_rotation = 0;
        self.next_sequence = 1;
        self.persist_chain_state()?;
        self.open_segment()?;
        Ok(())
    }

    fn open_segment(&mut self) -> Result<(), JournalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.segment_bytes = file.metadata()?.len();
        self.writer = Some(file);
        Ok(())
    }

    fn load_chain_state(&mut self) {
        let Ok(contents) = fs::read_to_string(&self.state_path) else {
            return;
        };
        let mut tokens = contents.split_whitespace();
        let hash = tokens.next().unwrap_or_default();
        let next_sequence = tokens
            .next()
            .and_then(|token| token.parse::<u64>().ok())
            .unwrap_or(0);
        let entries = tokens
            .next()
            .and_then(|token| token.parse::<u64>().ok())
            .unwrap_or(0);

        if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            self.chain_hash = hash.to_ascii_lowercase();
        } else {
            self.chain_hash = ZERO_CHAIN_HASH.to_string();
        }
        self.next_sequence = if next_sequence == 0 { 1 } else { next_sequence };
        self.entries_since_rotation = entries;
    }

    fn persist_chain_state(&self) -> Result<(), JournalError> {
        fs::write(
            &self.state_path,
            format!(
                "{}\n{}\n{}\n",
                self.chain_hash, self.next_sequence, self.entries_since_rotation
            ),
        )?;
        Ok(())
    }
}

fn chain_state_path(path: &Path) -> PathBuf {
    path_with_suffix(path, "chainstate")
}

/// Appends `.suffix` to a full file name, keeping any existing extension.
fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn ensure_directory(path: &Path) -> Result<(), JournalError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(parent)?;
        let mut permissions = metadata.permissions();
        let narrowed = permissions.mode() & 0o750;
        if narrowed != permissions.mode() & 0o7777 {
            permissions.set_mode(narrowed);
            fs::set_permissions(parent, permissions)?;
        }
    }
    Ok(())
}
