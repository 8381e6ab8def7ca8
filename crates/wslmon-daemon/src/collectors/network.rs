//! Network interface counter watcher.
//!
//! Every fifteen seconds `/proc/net/dev` is parsed and per-interface
//! byte/error/drop counters compared with the previous sample. Loopback
//! is skipped. A non-zero error delta emits Warning; a drop-only delta
//! emits Info.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const SOURCE: &str = "net.dev";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Cumulative counters for one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

/// Parses one `/proc/net/dev` data line.
///
/// Receive fields: bytes packets errs drop fifo frame compressed
/// multicast; transmit fields follow in the same shape.
pub(crate) fn parse_interface_line(line: &str) -> Option<(String, InterfaceCounters)> {
    let (name, rest) = line.split_once(':')?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let fields: Vec<u64> = rest
        .split_whitespace()
        .map(|field| field.parse::<u64>().unwrap_or(0))
        .collect();
    if fields.len() < 12 {
        return None;
    }
    Some((
        name,
        InterfaceCounters {
            rx_bytes: fields[0],
            rx_errors: fields[2],
            rx_dropped: fields[3],
            tx_bytes: fields[8],
            tx_errors: fields[10],
            tx_dropped: fields[11],
        },
    ))
}

/// Network counter collector.
pub struct NetworkCollector {
    dev_path: PathBuf,
    worker: WorkerHandle,
}

impl NetworkCollector {
    /// Collector over the live `/proc/net/dev`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path("/proc/net/dev")
    }

    /// Collector over an injected counters file.
    pub fn with_path(dev_path: impl Into<PathBuf>) -> Self {
        Self {
            dev_path: dev_path.into(),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for NetworkCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for NetworkCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let dev_path = self.dev_path.clone();
        self.worker.spawn(
            SOURCE,
            Category::Network,
            supervisor,
            move |supervisor, stop| {
                let mut last_state: HashMap<String, InterfaceCounters> = HashMap::new();
                let mut warned = false;
                loop {
                    match fs::read_to_string(&dev_path) {
                        Ok(contents) => {
                            warned = false;
                            // The first two lines are column headers.
                            for line in contents.lines().skip(2) {
                                let Some((name, counters)) = parse_interface_line(line) else {
                                    continue;
                                };
                                if name == "lo" {
                                    continue;
                                }
                                if let Some(previous) = last_state.get(&name) {
                                    emit_deltas(supervisor, &name, *previous, counters);
                                }
                                last_state.insert(name, counters);
                            }
                        },
                        Err(err) => {
                            if !warned {
                                let mut failure = record(
                                    SOURCE,
                                    Category::Network,
                                    Severity::Warning,
                                    "Cannot read network counters",
                                );
                                failure.set_attribute("path", dev_path.display().to_string());
                                failure.set_attribute("error", err.to_string());
                                supervisor.emit(failure);
                                warned = true;
                            }
                        },
                    }
                    if stop.wait_timeout(SAMPLE_INTERVAL) {
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

fn emit_deltas(
    supervisor: &Arc<Supervisor>,
    name: &str,
    previous: InterfaceCounters,
    current: InterfaceCounters,
) {
    let rx_drop = current.rx_dropped.saturating_sub(previous.rx_dropped);
    let tx_drop = current.tx_dropped.saturating_sub(previous.tx_dropped);
    let rx_err = current.rx_errors.saturating_sub(previous.rx_errors);
    let tx_err = current.tx_errors.saturating_sub(previous.tx_errors);
    if rx_drop == 0 && tx_drop == 0 && rx_err == 0 && tx_err == 0 {
        return;
    }
    let severity = if rx_err + tx_err > 0 {
        Severity::Warning
    } else {
        Severity::Info
    };
    let mut event = record(
        SOURCE,
        Category::Network,
        severity,
        "Interface error counters increased",
    );
    event.set_attribute("interface", name);
    event.set_attribute("rx_dropped", rx_drop.to_string());
    event.set_attribute("tx_dropped", tx_drop.to_string());
    event.set_attribute("rx_errors", rx_err.to_string());
    event.set_attribute("tx_errors", tx_err.to_string());
    event.set_attribute("rx_bytes", current.rx_bytes.to_string());
    event.set_attribute("tx_bytes", current.tx_bytes.to_string());
    supervisor.emit(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0: 52000    400    2    1    0     0          0         0    98000     350    0    3    0     0       0          0
";

    #[test]
    fn test_parse_interface_line() {
        let line = SAMPLE.lines().nth(3).unwrap();
        let (name, counters) = parse_interface_line(line).unwrap();
        assert_eq!(name, "eth0");
        assert_eq!(counters.rx_bytes, 52000);
        assert_eq!(counters.rx_errors, 2);
        assert_eq!(counters.rx_dropped, 1);
        assert_eq!(counters.tx_bytes, 98000);
        assert_eq!(counters.tx_errors, 0);
        assert_eq!(counters.tx_dropped, 3);
    }

    #[test]
    fn test_parse_rejects_headers() {
        assert!(parse_interface_line(SAMPLE.lines().next().unwrap()).is_none());
    }
}
