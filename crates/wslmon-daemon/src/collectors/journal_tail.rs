//! System journal tail.
//!
//! Subscribes to the systemd units and kernel transport the fabric cares
//! about and emits one Info record per entry with `unit`, `transport`,
//! and `priority` attributes. The default source follows `journalctl`
//! starting from the tail minus ten records; tests inject a stub.

use std::io::{self, BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

const SOURCE: &str = "systemd.journal";
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Journal matches mirrored from the units and transports the original
/// deployment watches.
const DEFAULT_MATCHES: &[&str] = &[
    "SYSLOG_IDENTIFIER=systemd",
    "+",
    "SYSLOG_IDENTIFIER=kernel",
    "+",
    "SYSLOG_IDENTIFIER=systemd-oomd",
    "+",
    "_SYSTEMD_UNIT=systemd-networkd.service",
    "+",
    "_SYSTEMD_UNIT=systemd-resolved.service",
    "+",
    "_SYSTEMD_UNIT=systemd-logind.service",
    "+",
    "_TRANSPORT=kernel",
];

/// One parsed journal entry.
#[derive(Debug, Clone, Default)]
pub struct JournalEntry {
    /// Human-readable message.
    pub message: String,
    /// Originating systemd unit, if any.
    pub unit: String,
    /// Journal transport.
    pub transport: String,
    /// Syslog priority as text.
    pub priority: String,
}

/// A source of parsed journal entries.
pub trait JournalSource: Send {
    /// Returns the next batch of entries, blocking at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the stream cannot be opened or ended.
    fn poll(&mut self, timeout: Duration) -> io::Result<Vec<JournalEntry>>;
}

/// Follows `journalctl --follow --output=json` through a reader thread.
///
/// The child is spawned lazily on the first poll; a dead stream surfaces
/// as an error from `poll` and is respawned on the next one.
pub struct JournalctlSource {
    matches: Vec<String>,
    child: Option<Child>,
    receiver: Option<Receiver<JournalEntry>>,
}

impl JournalctlSource {
    /// Source with the default unit and transport matches.
    #[must_use]
    pub fn new() -> Self {
        Self {
            matches: DEFAULT_MATCHES.iter().map(ToString::to_string).collect(),
            child: None,
            receiver: None,
        }
    }

    fn ensure_spawned(&mut self) -> io::Result<()> {
        if self.receiver.is_some() {
            return Ok(());
        }
        let mut child = Command::new("journalctl")
            .arg("--follow")
            .arg("--lines=10")
            .arg("--output=json")
            .args(&self.matches)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("journalctl stdout unavailable"))?;
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name("journalctl-reader".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if let Some(entry) = parse_journal_json(&line) {
                        if sender.send(entry).is_err() {
                            break;
                        }
                    }
                }
            })?;
        self.child = Some(child);
        self.receiver = Some(receiver);
        Ok(())
    }
}

impl Default for JournalctlSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JournalctlSource {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl JournalSource for JournalctlSource {
    fn poll(&mut self, timeout: Duration) -> io::Result<Vec<JournalEntry>> {
        self.ensure_spawned()?;
        let Some(receiver) = &self.receiver else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        match receiver.recv_timeout(timeout) {
            Ok(entry) => {
                entries.push(entry);
                while let Ok(more) = receiver.try_recv() {
                    entries.push(more);
                }
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => {
                // Force a respawn on the next poll.
                self.receiver = None;
                if let Some(mut child) = self.child.take() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(io::Error::other("journal stream ended"));
            },
        }
        Ok(entries)
    }
}

/// Extracts the fields of interest from one `journalctl -o json` line.
pub(crate) fn parse_journal_json(line: &str) -> Option<JournalEntry> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let field = |key: &str| -> String {
        match value.get(key) {
            Some(serde_json::Value::String(text)) => text.clone(),
            // Binary-safe fields arrive as byte arrays; render them.
            Some(serde_json::Value::Array(bytes)) => {
                let raw: Vec<u8> = bytes
                    .iter()
                    .filter_map(serde_json::Value::as_u64)
                    .filter_map(|byte| u8::try_from(byte).ok())
                    .collect();
                String::from_utf8_lossy(&raw).into_owned()
            },
            _ => String::new(),
        }
    };
    Some(JournalEntry {
        message: field("MESSAGE").trim_end().to_string(),
        unit: field("_SYSTEMD_UNIT"),
        transport: field("_TRANSPORT"),
        priority: field("PRIORITY"),
    })
}

/// System journal tail collector.
pub struct JournalTailCollector {
    source: Option<Box<dyn JournalSource>>,
    worker: WorkerHandle,
}

impl JournalTailCollector {
    /// Collector over the default `journalctl` follower.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Box::new(JournalctlSource::new()))
    }

    /// Collector over an injected source.
    #[must_use]
    pub fn with_source(source: Box<dyn JournalSource>) -> Self {
        Self {
            source: Some(source),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for JournalTailCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for JournalTailCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(source) = self.source.take() else {
            return;
        };
        self.worker
            .spawn(SOURCE, Category::Journal, supervisor, move |supervisor, stop| {
                run(source, supervisor, stop);
            });
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

fn run(mut source: Box<dyn JournalSource>, supervisor: &Arc<Supervisor>, stop: &StopSignal) {
    let mut last_error: Option<String> = None;
    while !stop.is_triggered() {
        match source.poll(POLL_INTERVAL) {
            Ok(entries) => {
                last_error = None;
                for entry in entries {
                    let mut event =
                        record(SOURCE, Category::Journal, Severity::Info, entry.message);
                    event.set_attribute("unit", entry.unit);
                    event.set_attribute("transport", entry.transport);
                    event.set_attribute("priority", entry.priority);
                    supervisor.emit(event);
                }
            },
            Err(err) => {
                let message = err.to_string();
                if last_error.as_deref() != Some(&message) {
                    let mut failure = record(
                        SOURCE,
                        Category::Journal,
                        Severity::Error,
                        "Failed to open systemd journal",
                    );
                    failure.set_attribute("error", &message);
                    supervisor.emit(failure);
                    last_error = Some(message);
                }
                if stop.wait_timeout(ERROR_BACKOFF) {
                    break;
                }
            },
        }
    }
}
