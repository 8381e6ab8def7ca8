//! Kernel ring message tail.
//!
//! Classifies each kernel log line by keyword: panic/fatal/bug are
//! Critical, error/warn/oom are Warning, everything else Info.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use wslmon_core::event::{Category, Severity};

use super::{contains_any_keyword, record, Collector, WorkerHandle};
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

const SOURCE: &str = "kernel.kmsg";
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// A source of raw kernel log lines.
pub trait KmsgSource: Send {
    /// Returns the next batch of lines, blocking at most `timeout`.
    /// An empty batch means the timeout elapsed quietly.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the stream cannot be read.
    fn poll(&mut self, timeout: Duration) -> io::Result<Vec<String>>;
}

/// Non-blocking reader over `/dev/kmsg` (or an injected path).
///
/// The device is opened lazily on the first poll so open failures surface
/// inside the worker, where they become records.
pub struct DevKmsgSource {
    path: PathBuf,
    file: Option<File>,
}

impl DevKmsgSource {
    /// Reader over the real kernel message device.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path("/dev/kmsg")
    }

    /// Reader over an arbitrary path (tests use a FIFO or plain file).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            use std::os::unix::fs::OpenOptionsExt;
            let file = std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(&self.path)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("kmsg device not open"))
    }
}

impl Default for DevKmsgSource {
    fn default() -> Self {
        Self::new()
    }
}

impl KmsgSource for DevKmsgSource {
    fn poll(&mut self, timeout: Duration) -> io::Result<Vec<String>> {
        let file = self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => {
                    for line in String::from_utf8_lossy(&buffer[..count]).lines() {
                        if !line.is_empty() {
                            lines.push(line.to_string());
                        }
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !lines.is_empty() || Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                },
                Err(err) => return Err(err),
            }
        }
        Ok(lines)
    }
}

/// Classifies one kernel line.
pub(crate) fn classify_kernel_line(line: &str) -> Severity {
    if contains_any_keyword(line, &["panic", "fatal", "bug"]) {
        Severity::Critical
    } else if contains_any_keyword(line, &["error", "warn", "oom"]) {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Kernel message tail collector.
pub struct KmsgCollector {
    source: Option<Box<dyn KmsgSource>>,
    worker: WorkerHandle,
}

impl KmsgCollector {
    /// Collector over `/dev/kmsg`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Box::new(DevKmsgSource::new()))
    }

    /// Collector over an injected source.
    #[must_use]
    pub fn with_source(source: Box<dyn KmsgSource>) -> Self {
        Self {
            source: Some(source),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for KmsgCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for KmsgCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(source) = self.source.take() else {
            return;
        };
        self.worker
            .spawn(SOURCE, Category::Kernel, supervisor, move |supervisor, stop| {
                run(source, supervisor, stop);
            });
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

fn run(mut source: Box<dyn KmsgSource>, supervisor: &Arc<Supervisor>, stop: &StopSignal) {
    let mut last_error: Option<String> = None;
    while !stop.is_triggered() {
        match source.poll(POLL_INTERVAL) {
            Ok(lines) => {
                last_error = None;
                for line in lines {
                    let severity = classify_kernel_line(&line);
                    supervisor.emit(record(SOURCE, Category::Kernel, severity, line));
                }
            },
            Err(err) => {
                let message = err.to_string();
                if last_error.as_deref() != Some(&message) {
                    let mut failure = record(
                        SOURCE,
                        Category::Kernel,
                        Severity::Warning,
                        "Unable to read kernel message stream",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_keywords() {
        assert_eq!(
            classify_kernel_line("Kernel panic - not syncing"),
            Severity::Critical
        );
        assert_eq!(classify_kernel_line("FATAL exception"), Severity::Critical);
        assert_eq!(classify_kernel_line("BUG: unable to handle"), Severity::Critical);
        assert_eq!(
            classify_kernel_line("EXT4-fs error (device sda1)"),
            Severity::Warning
        );
        assert_eq!(
            classify_kernel_line("Out of memory: oom-kill"),
            Severity::Warning
        );
        assert_eq!(classify_kernel_line("usb 1-1: new device"), Severity::Info);
    }

    #[test]
    fn test_dev_kmsg_source_reads_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kmsg");
        std::fs::write(&path, "6,1,1,-;line one\n4,2,2,-;line two\n").unwrap();
        let mut source = DevKmsgSource::with_path(&path);
        let lines = source.poll(Duration::from_millis(50)).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("line one"));
    }

    #[test]
    fn test_dev_kmsg_source_missing_path_errors() {
        let mut source = DevKmsgSource::with_path("/nonexistent/kmsg");
        assert!(source.poll(Duration::from_millis(10)).is_err());
    }
}
