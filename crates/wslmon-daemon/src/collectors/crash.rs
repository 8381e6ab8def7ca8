//! Crash dump directory watcher.
//!
//! Emits one Critical record per file that appears in (or is moved into)
//! the crash directory after the collector started. The first successful
//! scan primes the seen-set without emitting, so dumps predating the
//! daemon do not flood the journal on startup.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const SOURCE: &str = "crash.watch";
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Crash dump watcher collector.
pub struct CrashWatchCollector {
    directory: PathBuf,
    worker: WorkerHandle,
}

impl CrashWatchCollector {
    /// Watcher over the given crash directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            worker: WorkerHandle::new(),
        }
    }
}

impl Collector for CrashWatchCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let directory = self.directory.clone();
        self.worker.spawn(
            SOURCE,
            Category::Crash,
            supervisor,
            move |supervisor, stop| {
                let mut seen: HashSet<OsString> = HashSet::new();
                let mut primed = false;
                let mut warned = false;
                loop {
                    match std::fs::read_dir(&directory) {
                        Ok(entries) => {
                            for entry in entries.flatten() {
                                let name = entry.file_name();
                                if !seen.insert(name.clone()) {
                                    continue;
                                }
                                if primed {
                                    let mut event = record(
                                        SOURCE,
                                        Category::Crash,
                                        Severity::Critical,
                                        "Crash dump detected",
                                    );
                                    event.set_attribute(
                                        "path",
                                        directory.join(&name).display().to_string(),
                                    );
                                    supervisor.emit(event);
                                }
                            }
                            primed = true;
                            warned = false;
                        },
                        Err(err) => {
                            if !warned {
                                let mut failure = record(
                                    SOURCE,
                                    Category::Crash,
                                    Severity::Warning,
                                    "Cannot watch crash directory",
                                );
                                failure.set_attribute("path", directory.display().to_string());
                                failure.set_attribute("error", err.to_string());
                                supervisor.emit(failure);
                                warned = true;
                            }
                        },
                    }
                    if stop.wait_timeout(SCAN_INTERVAL) {
                        break;
                    }
                }
            },
        );
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}
