//! Failed service unit poller.
//!
//! Every thirty seconds the list of failed units is fetched; a Warning is
//! emitted only when the list is non-empty and differs from the previous
//! sample, so a stuck unit produces one record rather than a stream.

use std::io;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const SOURCE: &str = "systemd.failures";
const POLL_INTERVAL: Duration = Duration::from_secs(30);

fn category() -> Category {
    Category::Other("Systemd".to_string())
}

/// A source of the current failed unit listing.
pub trait FailedUnitSource: Send {
    /// Returns the raw failed-unit listing; empty means all units healthy.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the listing cannot be obtained.
    fn failed_units(&mut self) -> io::Result<String>;
}

/// Queries `systemctl --failed`.
pub struct SystemctlFailedSource;

impl FailedUnitSource for SystemctlFailedSource {
    fn failed_units(&mut self) -> io::Result<String> {
        let output = Command::new("systemctl")
            .args(["--failed", "--no-legend", "--plain"])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "systemctl exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Failed unit poller collector.
pub struct UnitFailureCollector {
    source: Option<Box<dyn FailedUnitSource>>,
    worker: WorkerHandle,
}

impl UnitFailureCollector {
    /// Collector over `systemctl --failed`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Box::new(SystemctlFailedSource))
    }

    /// Collector over an injected source.
    #[must_use]
    pub fn with_source(source: Box<dyn FailedUnitSource>) -> Self {
        Self {
            source: Some(source),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for UnitFailureCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for UnitFailureCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(mut source) = self.source.take() else {
            return;
        };
        self.worker
            .spawn(SOURCE, category(), supervisor, move |supervisor, stop| {
                let mut last_output = String::new();
                let mut last_error: Option<String> = None;
                loop {
                    match source.failed_units() {
                        Ok(output) => {
                            last_error = None;
                            if output.is_empty() {
                                last_output.clear();
                            } else if output != last_output {
                                let mut event = record(
                                    SOURCE,
                                    category(),
                                    Severity::Warning,
                                    "Systemd units failing",
                                );
                                event.set_attribute("units", output.trim_end());
                                supervisor.emit(event);
                                last_output = output;
                            }
                        },
                        Err(err) => {
                            let message = err.to_string();
                            if last_error.as_deref() != Some(&message) {
                                let mut failure = record(
                                    SOURCE,
                                    category(),
                                    Severity::Warning,
                                    "Failed to query failed units",
                                );
                                failure.set_attribute("error", &message);
                                supervisor.emit(failure);
                                last_error = Some(message);
                            }
                        },
                    }
                    if stop.wait_timeout(POLL_INTERVAL) {
                        break;
                    }
                }
            });
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}
