//! The per-side supervisor facade.
//!
//! One supervisor owns the journal, the in-memory ring, the bridge, and
//! the collector set. Collectors call [`Supervisor::emit`] concurrently;
//! the bridge's inbound callback re-enters the same path. Internally the
//! journal mutex serialises appends and the ring has its own lock, so the
//! facade itself stays lock-free.
//!
//! Every emitted record is stamped (timestamp, hostname, stable machine
//! identifiers), appended to the journal, pushed into the ring, and - when
//! a bridge is attached and the record did not arrive from the peer -
//! cloned into the bridge's outbound queue. Peer records are recognised by
//! their `peer_origin` attribute and are never forwarded back.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};
use wslmon_core::event::EventRecord;
use wslmon_core::journal::Journal;
use wslmon_core::ring::RingBuffer;

use crate::bridge::{Bridge, BridgeConfig};
use crate::collectors::Collector;

/// Attribute marking a record as received from the peer side.
pub const PEER_ORIGIN_ATTRIBUTE: &str = "peer_origin";

/// Stable identity stamped onto every record.
#[derive(Debug, Clone, Default)]
pub struct HostIdentity {
    /// Machine hostname.
    pub hostname: String,
    /// Stable machine identifier.
    pub machine_id: String,
    /// Identifier of the current boot.
    pub boot_id: String,
}

impl HostIdentity {
    /// Detects the local identity from the running system. Missing pieces
    /// stay empty and are simply not stamped.
    #[must_use]
    pub fn detect() -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            hostname,
            machine_id: read_trimmed("/etc/machine-id"),
            boot_id: read_trimmed("/proc/sys/kernel/random/boot_id"),
        }
    }
}

fn read_trimmed(path: &str) -> String {
    fs::read_to_string(path)
        .map(|contents| contents.trim().to_string())
        .unwrap_or_default()
}

/// The thread-safe facade every worker talks to.
pub struct Supervisor {
    journal: Journal,
    ring: RingBuffer<EventRecord>,
    identity: HostIdentity,
    bridge: Mutex<Option<Bridge>>,
    collectors: Mutex<Vec<Box<dyn Collector>>>,
    running: AtomicBool,
}

impl Supervisor {
    /// Creates a supervisor around an opened journal.
    pub fn new(journal: Journal, ring_capacity: usize, identity: HostIdentity) -> Arc<Self> {
        Arc::new(Self {
            journal,
            ring: RingBuffer::new(ring_capacity),
            identity,
            bridge: Mutex::new(None),
            collectors: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Attaches the bridge and starts its workers. Inbound peer records
    /// re-enter [`Supervisor::emit`] already tagged with `peer_origin`, so
    /// they are journalled but never forwarded back.
    pub fn attach_bridge(self: &Arc<Self>, config: BridgeConfig) {
        let weak = Arc::downgrade(self);
        let callback = Arc::new(move |record: EventRecord| {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.emit(record);
            }
        });
        let bridge = Bridge::start(config, callback);
        *self.bridge.lock().unwrap_or_else(PoisonError::into_inner) = Some(bridge);
    }

    /// Registers a collector. Collectors registered after
    /// [`Supervisor::start`] are started immediately.
    pub fn register(self: &Arc<Self>, mut collector: Box<dyn Collector>) {
        if self.running.load(Ordering::SeqCst) {
            collector.start(self);
        }
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(collector);
    }

    /// Starts every registered collector.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut collectors = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for collector in collectors.iter_mut() {
            debug!(name = collector.name(), "starting collector");
            collector.start(self);
        }
        info!(count = collectors.len(), "supervisor started");
    }

    /// Stops everything: clears the running flag, signals and joins every
    /// collector, then tears the bridge down. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut collectors = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for collector in collectors.iter_mut() {
            debug!(name = collector.name(), "stopping collector");
            collector.stop();
        }
        drop(collectors);
        // Take the bridge out before stopping it: its workers emit through
        // this supervisor and must not find the bridge mutex held while
        // stop() joins them.
        let bridge = self
            .bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut bridge) = bridge {
            bridge.stop();
        }
        info!("supervisor stopped");
    }

    /// Whether [`Supervisor::start`] has run and [`Supervisor::stop`] has
    /// not.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The emit pipeline: stamp, journal, ring, forward.
    ///
    /// Journal failures are logged and swallowed; an unavailable journal
    /// must not take the collectors down, and the next append recovers.
    pub fn emit(&self, record: EventRecord) {
        let mut record = record;
        if record.timestamp_unset() {
            record.timestamp = Utc::now();
        }
        record.ensure_attribute("hostname", self.identity.hostname.clone());
        record.ensure_attribute("machine_id", self.identity.machine_id.clone());
        record.ensure_attribute("boot_id", self.identity.boot_id.clone());

        let journalled = match self.journal.append(&record) {
            Ok(enriched) => enriched,
            Err(err) => {
                warn!(%err, "journal append failed, keeping record in memory only");
                record
            },
        };

        self.ring.push(journalled.clone());

        if journalled.attribute(PEER_ORIGIN_ATTRIBUTE).is_none() {
            if let Some(bridge) = &*self.bridge.lock().unwrap_or_else(PoisonError::into_inner) {
                bridge.enqueue_outbound(journalled);
            }
        }
    }

    /// Consistent copy of the in-memory ring, oldest first.
    #[must_use]
    pub fn ring_snapshot(&self) -> Vec<EventRecord> {
        self.ring.snapshot()
    }

    /// The underlying journal (used by shutdown paths that need a final
    /// explicit rotation or chain inspection).
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use wslmon_core::event::{Category, Severity};
    use wslmon_core::journal::{read_journal_file, JournalOptions};

    use super::*;

    fn test_supervisor(dir: &std::path::Path) -> Arc<Supervisor> {
        let journal = Journal::open(
            JournalOptions::new(dir.join("events.log"))
                .default_source("test")
                .hmac_key(None),
        )
        .unwrap();
        let identity = HostIdentity {
            hostname: "testhost".to_string(),
            machine_id: "machine-1".to_string(),
            boot_id: String::new(),
        };
        Supervisor::new(journal, 8, identity)
    }

    #[test]
    fn test_emit_stamps_identity_and_journals() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path());
        supervisor.emit(EventRecord::new(Category::General, Severity::Info, "hello"));

        let snapshot = supervisor.ring_snapshot();
        assert_eq!(snapshot.len(), 1);
        let record = &snapshot[0];
        assert_eq!(record.sequence, 1);
        assert!(!record.timestamp_unset());
        assert_eq!(record.attribute("hostname"), Some("testhost"));
        assert_eq!(record.attribute("machine_id"), Some("machine-1"));
        // Empty identity pieces are not stamped.
        assert_eq!(record.attribute("boot_id"), None);

        let lines = read_journal_file(&dir.path().join("events.log")).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].event.attribute("hostname"), Some("testhost"));
    }

    #[test]
    fn test_emit_does_not_clobber_collector_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path());
        let mut record = EventRecord::new(Category::General, Severity::Info, "x");
        record.set_attribute("hostname", "peer-host");
        supervisor.emit(record);
        let snapshot = supervisor.ring_snapshot();
        assert_eq!(snapshot[0].attribute("hostname"), Some("peer-host"));
    }

    #[test]
    fn test_ring_keeps_last_capacity_records() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path());
        for i in 0..20 {
            supervisor.emit(EventRecord::new(
                Category::General,
                Severity::Info,
                format!("event {i}"),
            ));
        }
        let snapshot = supervisor.ring_snapshot();
        assert_eq!(snapshot.len(), 8);
        assert_eq!(snapshot.first().unwrap().message, "event 12");
        assert_eq!(snapshot.last().unwrap().message, "event 19");
        // Journal kept everything regardless of the ring capacity.
        let lines = read_journal_file(&dir.path().join("events.log")).unwrap();
        assert_eq!(lines.len(), 20);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path());
        supervisor.start();
        supervisor.stop();
        supervisor.stop();
        assert!(!supervisor.is_running());
    }
}
