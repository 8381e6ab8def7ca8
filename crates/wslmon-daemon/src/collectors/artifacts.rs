//! Crash-artifact directory watcher.
//!
//! Every fifteen seconds a fixed list of directories is scanned; any file
//! whose last-write time is newer than the last one seen emits an Info
//! record with `path` and `last_write` attributes. Subdirectories are
//! not descended into.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const SOURCE: &str = "artifact.watch";
const SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// One watched artifact directory.
#[derive(Debug, Clone)]
pub struct WatchedDirectory {
    /// Directory to scan.
    pub path: PathBuf,
    /// Category stamped on records from this directory.
    pub category: Category,
}

impl WatchedDirectory {
    /// Creates a watched directory entry.
    pub fn new(path: impl Into<PathBuf>, category: Category) -> Self {
        Self {
            path: path.into(),
            category,
        }
    }
}

/// The crash-artifact directories of the original deployment.
#[must_use]
pub fn default_directories() -> Vec<WatchedDirectory> {
    vec![
        WatchedDirectory::new(
            "C:/ProgramData/Microsoft/Windows/WER/ReportQueue",
            Category::Wer,
        ),
        WatchedDirectory::new(
            "C:/ProgramData/Microsoft/Windows/WER/ReportArchive",
            Category::Wer,
        ),
        WatchedDirectory::new("C:/Windows/LiveKernelReports", Category::Wer),
    ]
}

/// Crash-artifact watcher collector.
pub struct ArtifactCollector {
    directories: Vec<WatchedDirectory>,
    worker: WorkerHandle,
}

impl ArtifactCollector {
    /// Watcher over the given directories.
    #[must_use]
    pub fn new(directories: Vec<WatchedDirectory>) -> Self {
        Self {
            directories,
            worker: WorkerHandle::new(),
        }
    }
}

impl Collector for ArtifactCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let directories = self.directories.clone();
        self.worker.spawn(
            SOURCE,
            Category::Wer,
            supervisor,
            move |supervisor, stop| {
                let mut states: Vec<HashMap<OsString, SystemTime>> =
                    directories.iter().map(|_| HashMap::new()).collect();
                let mut warned: Vec<bool> = directories.iter().map(|_| false).collect();
                loop {
                    for (index, directory) in directories.iter().enumerate() {
                        scan_directory(
                            supervisor,
                            directory,
                            &mut states[index],
                            &mut warned[index],
                        );
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

fn scan_directory(
    supervisor: &Arc<Supervisor>,
    directory: &WatchedDirectory,
    state: &mut HashMap<OsString, SystemTime>,
    warned: &mut bool,
) {
    let entries = match std::fs::read_dir(&directory.path) {
        Ok(entries) => entries,
        Err(err) => {
            if !*warned {
                let mut failure = record(
                    SOURCE,
                    directory.category.clone(),
                    Severity::Warning,
                    "Unable to enumerate directory",
                );
                failure.set_attribute("path", directory.path.display().to_string());
                failure.set_attribute("error", err.to_string());
                supervisor.emit(failure);
                *warned = true;
            }
            return;
        },
    };
    *warned = false;

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let name = entry.file_name();
        let is_new = match state.get(&name) {
            Some(seen) => *seen < modified,
            None => true,
        };
        if is_new {
            let mut event = record(
                SOURCE,
                directory.category.clone(),
                Severity::Info,
                "Crash artifact updated",
            );
            event.set_attribute("path", entry.path().display().to_string());
            event.set_attribute("last_write", format_last_write(modified));
            supervisor.emit(event);
            state.insert(name, modified);
        }
    }
}

fn format_last_write(modified: SystemTime) -> String {
    let datetime: DateTime<Utc> = modified.into();
    datetime.format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_last_write() {
        let formatted = format_last_write(SystemTime::UNIX_EPOCH);
        assert_eq!(formatted, "1970-01-01T00:00:00");
    }

    #[test]
    fn test_default_directories() {
        let directories = default_directories();
        assert_eq!(directories.len(), 3);
        assert!(directories
            .iter()
            .all(|directory| directory.category == Category::Wer));
    }
}
