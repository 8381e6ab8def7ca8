//! Signal collectors.
//!
//! A collector is a long-lived worker observing one signal source and
//! emitting [`EventRecord`]s through the supervisor. The supervisor owns
//! the collector set and drives `start`/`stop`; every worker honours the
//! shared stop signal within its polling interval.
//!
//! Collectors whose signal lives behind an OS API (service control,
//! security posture, structured event logs, power) take their source as
//! a trait object with a command-backed production default - `systemctl`
//! and `sc.exe` for services, a `root/SecurityCenter2` CIM query for
//! security posture, `Get-WinEvent` for the event log - so tests inject
//! stubs without touching the collector. The portable ones read `/proc`,
//! `/sys`, and plain directories directly, with paths injectable for
//! testing.
//!
//! Worker boundaries are panic-proof: a panicking collector body becomes
//! one Critical record and a dead worker, never a dead process.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};
use wslmon_core::event::{Category, EventRecord, Severity};

use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

pub mod artifacts;
pub mod crash;
pub mod diagnostics;
pub mod event_log;
pub mod journal_tail;
pub mod kmsg;
pub mod network;
pub mod power;
pub mod pressure;
pub mod process;
pub mod resource;
pub mod security;
pub mod service_state;
pub mod unit_failures;

pub use artifacts::ArtifactCollector;
pub use crash::CrashWatchCollector;
pub use diagnostics::DiagnosticsCollector;
pub use event_log::EventLogCollector;
pub use journal_tail::JournalTailCollector;
pub use kmsg::KmsgCollector;
pub use network::NetworkCollector;
pub use power::PowerCollector;
pub use pressure::PressureCollector;
pub use process::ProcessCollector;
pub use resource::ResourceCollector;
pub use security::SecurityCollector;
pub use service_state::ServiceStateCollector;
pub use unit_failures::UnitFailureCollector;

/// The collector lifecycle contract.
pub trait Collector: Send {
    /// Stable collector name, used as the record `source`.
    fn name(&self) -> &'static str;

    /// Spawns the worker. Setup failures are emitted as records, not
    /// returned; a collector that cannot start declines quietly and the
    /// supervisor stays up.
    fn start(&mut self, supervisor: &Arc<Supervisor>);

    /// Signals the worker to stop and joins it. Must be idempotent.
    fn stop(&mut self);
}

/// Stop signal plus join handle shared by every collector implementation.
pub(crate) struct WorkerHandle {
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new() -> Self {
        Self {
            stop: StopSignal::new(),
            thread: None,
        }
    }

    /// Spawns the worker body with a panic boundary. A spawn failure is a
    /// resource-exhaustion condition: one Error record, and the collector
    /// declines to start.
    pub(crate) fn spawn<F>(
        &mut self,
        name: &'static str,
        category: Category,
        supervisor: &Arc<Supervisor>,
        body: F,
    ) where
        F: FnOnce(&Arc<Supervisor>, &StopSignal) + Send + 'static,
    {
        if self.thread.is_some() {
            return;
        }
        let stop = self.stop.clone();
        let worker_supervisor = Arc::clone(supervisor);
        let worker_category = category.clone();
        let result = std::thread::Builder::new()
            .name(format!("collector-{name}"))
            .spawn(move || {
                let panic = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    body(&worker_supervisor, &stop);
                }));
                if let Err(payload) = panic {
                    let mut record = record(
                        name,
                        worker_category,
                        Severity::Critical,
                        format!("{name} collector worker panicked"),
                    );
                    record.set_attribute("panic", panic_message(payload.as_ref()));
                    worker_supervisor.emit(record);
                }
                debug!(name, "collector worker exited");
            });
        match result {
            Ok(handle) => self.thread = Some(handle),
            Err(err) => {
                warn!(name, %err, "failed to spawn collector worker");
                let mut failure = record(
                    name,
                    category,
                    Severity::Error,
                    format!("Failed to spawn {name} collector worker"),
                );
                failure.set_attribute("error", err.to_string());
                supervisor.emit(failure);
            },
        }
    }

    pub(crate) fn stop(&mut self) {
        self.stop.trigger();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Builds a record pre-filled with the collector's source name.
pub(crate) fn record(
    source: &str,
    category: Category,
    severity: Severity,
    message: impl Into<String>,
) -> EventRecord {
    let mut record = EventRecord::new(category, severity, message);
    record.source = source.to_string();
    record
}

/// Case-insensitive keyword scan used by the text-classifying collectors.
pub(crate) fn contains_any_keyword(line: &str, keywords: &[&str]) -> bool {
    let lowered = line.to_lowercase();
    keywords.iter().any(|keyword| lowered.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_any_keyword_is_case_insensitive() {
        assert!(contains_any_keyword(
            "Kernel PANIC: not syncing",
            &["panic", "fatal"]
        ));
        assert!(!contains_any_keyword("all quiet", &["panic", "fatal"]));
    }

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new("again".to_string());
        assert_eq!(panic_message(payload.as_ref()), "again");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
