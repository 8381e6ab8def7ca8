//! Tracked process sampler.
//!
//! Every three seconds the process table is enumerated and matched
//! against a static name list (the virtualisation stack's user and
//! kernel helpers by default). New pids emit Info, disappeared pids emit
//! Warning. For each matched pid the working set is tested against
//! physical memory: above 90 % is Critical, above 75 % is Warning, and a
//! growth of more than 25 % or 256 MiB since the previous sample is a
//! Warning as well.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

const SOURCE: &str = "process.monitor";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(3);
const GROWTH_ABSOLUTE_BYTES: u64 = 256 * 1024 * 1024;

/// One enumerated process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: u32,
    /// Executable name.
    pub name: String,
    /// Parent process id.
    pub parent_pid: u32,
    /// Resident working set in bytes.
    pub working_set: u64,
    /// Committed virtual size in bytes.
    pub commit: u64,
}

/// A source of process table snapshots.
pub trait ProcessSource: Send {
    /// Enumerates the current processes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the table cannot be read.
    fn snapshot(&mut self) -> io::Result<Vec<ProcessInfo>>;

    /// Total physical memory in bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the total cannot be determined.
    fn physical_memory(&mut self) -> io::Result<u64>;
}

/// Process table reader over `/proc`.
pub struct ProcfsProcessSource {
    proc_path: PathBuf,
}

impl ProcfsProcessSource {
    /// Reader over the live `/proc`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path("/proc")
    }

    /// Reader over an injected proc root (tests build a fake tree).
    pub fn with_path(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
        }
    }
}

impl Default for ProcfsProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for ProcfsProcessSource {
    fn snapshot(&mut self) -> io::Result<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        for entry in fs::read_dir(&self.proc_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|text| text.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(status) = fs::read_to_string(entry.path().join("status")) else {
                continue;
            };
            processes.push(parse_proc_status(pid, &status));
        }
        Ok(processes)
    }

    fn physical_memory(&mut self) -> io::Result<u64> {
        let meminfo = fs::read_to_string(self.proc_path.join("meminfo"))?;
        for line in meminfo.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("MemTotal:") {
                if let Some(Ok(kib)) = fields.next().map(str::parse::<u64>) {
                    return Ok(kib * 1024);
                }
            }
        }
        Err(io::Error::other("MemTotal missing from meminfo"))
    }
}

pub(crate) fn parse_proc_status(pid: u32, status: &str) -> ProcessInfo {
    let mut info = ProcessInfo {
        pid,
        ..ProcessInfo::default()
    };
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Name" => info.name = value.to_string(),
            "PPid" => info.parent_pid = value.parse().unwrap_or(0),
            "VmRSS" => info.working_set = parse_kib(value),
            "VmSize" => info.commit = parse_kib(value),
            _ => {},
        }
    }
    info
}

fn parse_kib(value: &str) -> u64 {
    value
        .split_whitespace()
        .next()
        .and_then(|kib| kib.parse::<u64>().ok())
        .map_or(0, |kib| kib * 1024)
}

/// Working-set verdict for one matched process.
pub(crate) fn evaluate_working_set(
    working_set: u64,
    previous: Option<u64>,
    physical: u64,
) -> Option<Severity> {
    if physical > 0 {
        if working_set * 10 > physical * 9 {
            return Some(Severity::Critical);
        }
        if working_set * 4 > physical * 3 {
            return Some(Severity::Warning);
        }
    }
    if let Some(previous) = previous {
        let growth = working_set.saturating_sub(previous);
        if growth > GROWTH_ABSOLUTE_BYTES || (previous > 0 && growth * 4 > previous) {
            return Some(Severity::Warning);
        }
    }
    None
}

/// Tracked process collector.
pub struct ProcessCollector {
    names: Vec<String>,
    source: Option<Box<dyn ProcessSource>>,
    worker: WorkerHandle,
}

impl ProcessCollector {
    /// Collector over an injected source and name list.
    pub fn new(source: Box<dyn ProcessSource>, names: Vec<String>) -> Self {
        Self {
            names: names.into_iter().map(|name| name.to_lowercase()).collect(),
            source: Some(source),
            worker: WorkerHandle::new(),
        }
    }

    /// Collector over `/proc` for the given names.
    #[must_use]
    pub fn procfs(names: Vec<String>) -> Self {
        Self::new(Box::new(ProcfsProcessSource::new()), names)
    }
}

impl Collector for ProcessCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(source) = self.source.take() else {
            return;
        };
        let names = self.names.clone();
        self.worker.spawn(
            SOURCE,
            Category::Process,
            supervisor,
            move |supervisor, stop| run(source, &names, supervisor, stop),
        );
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

fn run(
    mut source: Box<dyn ProcessSource>,
    names: &[String],
    supervisor: &Arc<Supervisor>,
    stop: &StopSignal,
) {
    let mut last_working_sets: HashMap<u32, u64> = HashMap::new();
    let mut last_error: Option<String> = None;
    let mut physical = 0u64;

    while !stop.wait_timeout(SAMPLE_INTERVAL) {
        if physical == 0 {
            physical = source.physical_memory().unwrap_or(0);
        }
        let snapshot = match source.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let message = err.to_string();
                if last_error.as_deref() != Some(&message) {
                    let mut failure = record(
                        SOURCE,
                        Category::Process,
                        Severity::Warning,
                        "Process snapshot failed",
                    );
                    failure.set_attribute("error", &message);
                    supervisor.emit(failure);
                    last_error = Some(message);
                }
                continue;
            },
        };
        last_error = None;

        let mut current: HashMap<u32, u64> = HashMap::new();
        for process in snapshot {
            if !names.contains(&process.name.to_lowercase()) {
                continue;
            }
            let previous = last_working_sets.get(&process.pid).copied();
            current.insert(process.pid, process.working_set);

            if previous.is_none() {
                let mut started = record(
                    SOURCE,
                    Category::Process,
                    Severity::Info,
                    "Tracked process started",
                );
                started.set_attribute("name", &process.name);
                started.set_attribute("pid", process.pid.to_string());
                started.set_attribute("parent_pid", process.parent_pid.to_string());
                supervisor.emit(started);
            }

            if let Some(severity) = evaluate_working_set(process.working_set, previous, physical) {
                let mut event = record(
                    SOURCE,
                    Category::Process,
                    severity,
                    "Tracked process memory pressure",
                );
                event.set_attribute("name", &process.name);
                event.set_attribute("pid", process.pid.to_string());
                event.set_attribute("working_set", process.working_set.to_string());
                event.set_attribute("commit", process.commit.to_string());
                if physical > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let percent = process.working_set as f64 / physical as f64 * 100.0;
                    event.set_attribute("working_set_percent", format!("{percent:.1}"));
                }
                supervisor.emit(event);
            }
        }

        for pid in last_working_sets.keys() {
            if !current.contains_key(pid) {
                let mut exited = record(
                    SOURCE,
                    Category::Process,
                    Severity::Warning,
                    "Tracked process exited",
                );
                exited.set_attribute("pid", pid.to_string());
                supervisor.emit(exited);
            }
        }

        last_working_sets = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tvmmem\nUmask:\t0022\nPPid:\t12\nVmSize:\t  2048 kB\nVmRSS:\t  1024 kB\n";
        let info = parse_proc_status(7, status);
        assert_eq!(info.pid, 7);
        assert_eq!(info.name, "vmmem");
        assert_eq!(info.parent_pid, 12);
        assert_eq!(info.working_set, 1024 * 1024);
        assert_eq!(info.commit, 2048 * 1024);
    }

    #[test]
    fn test_working_set_thresholds() {
        let physical = 1000u64;
        assert_eq!(
            evaluate_working_set(950, None, physical),
            Some(Severity::Critical)
        );
        assert_eq!(
            evaluate_working_set(800, None, physical),
            Some(Severity::Warning)
        );
        assert_eq!(evaluate_working_set(100, None, physical), None);
    }

    #[test]
    fn test_working_set_growth_rules() {
        let physical = 100_000_000_000u64;
        // 30% growth trips the relative gate.
        assert_eq!(
            evaluate_working_set(1_300_000, Some(1_000_000), physical),
            Some(Severity::Warning)
        );
        // Flat usage stays quiet.
        assert_eq!(evaluate_working_set(1_000_000, Some(1_000_000), physical), None);
        // A large absolute jump trips even below 25%.
        let base = 2_000_000_000u64;
        assert_eq!(
            evaluate_working_set(base + 300 * 1024 * 1024, Some(base), physical),
            Some(Severity::Warning)
        );
    }

    #[test]
    fn test_procfs_source_reads_fake_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("42")).unwrap();
        fs::write(
            dir.path().join("42/status"),
            "Name:\twsl\nPPid:\t1\nVmRSS:\t512 kB\nVmSize:\t1024 kB\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("irq")).unwrap();
        fs::write(dir.path().join("meminfo"), "MemTotal: 2048 kB\n").unwrap();

        let mut source = ProcfsProcessSource::with_path(dir.path());
        let snapshot = source.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "wsl");
        assert_eq!(source.physical_memory().unwrap(), 2048 * 1024);
    }
}
