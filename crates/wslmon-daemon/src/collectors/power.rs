//! Power status poller.
//!
//! Samples the power source every five seconds and emits only when the
//! status changed. When the source reports an active power scheme a
//! companion record carries its identifier.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const SOURCE: &str = "power.monitor";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// One power status sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerStatus {
    /// AC line state: `Online`, `Offline`, or `Unknown`.
    pub ac_state: String,
    /// Battery flag text (`High`, `Low|Charging`, `NoBattery`, ...).
    pub battery_flags: String,
    /// Battery charge percentage, when a battery is present.
    pub battery_percent: Option<u8>,
    /// Active power scheme identifier, when the platform reports one.
    pub scheme: Option<String>,
}

/// A source of power status samples.
pub trait PowerSource: Send {
    /// Samples the current power status.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the power API is unavailable.
    fn sample(&mut self) -> io::Result<PowerStatus>;
}

/// Reads `/sys/class/power_supply`.
pub struct SysfsPowerSource {
    base: PathBuf,
}

impl SysfsPowerSource {
    /// Reader over the live sysfs tree.
    #[must_use]
    pub fn new() -> Self {
        Self::with_path("/sys/class/power_supply")
    }

    /// Reader over an injected tree (tests build a fake one).
    pub fn with_path(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Default for SysfsPowerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSource for SysfsPowerSource {
    fn sample(&mut self) -> io::Result<PowerStatus> {
        let mut status = PowerStatus {
            ac_state: "Unknown".to_string(),
            battery_flags: "NoBattery".to_string(),
            battery_percent: None,
            scheme: None,
        };
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            let path = entry.path();
            let supply_type = read_trimmed(&path.join("type"));
            match supply_type.as_str() {
                "Mains" => {
                    status.ac_state = match read_trimmed(&path.join("online")).as_str() {
                        "1" => "Online".to_string(),
                        "0" => "Offline".to_string(),
                        _ => "Unknown".to_string(),
                    };
                },
                "Battery" => {
                    status.battery_percent = read_trimmed(&path.join("capacity")).parse().ok();
                    let state = read_trimmed(&path.join("status"));
                    status.battery_flags = if state.is_empty() {
                        "Unknown".to_string()
                    } else {
                        state
                    };
                },
                _ => {},
            }
        }
        Ok(status)
    }
}

fn read_trimmed(path: &std::path::Path) -> String {
    fs::read_to_string(path)
        .map(|contents| contents.trim().to_string())
        .unwrap_or_default()
}

/// Power status collector.
pub struct PowerCollector {
    source: Option<Box<dyn PowerSource>>,
    worker: WorkerHandle,
}

impl PowerCollector {
    /// Collector over the sysfs power tree.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Box::new(SysfsPowerSource::new()))
    }

    /// Collector over an injected source.
    #[must_use]
    pub fn with_source(source: Box<dyn PowerSource>) -> Self {
        Self {
            source: Some(source),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for PowerCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for PowerCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(mut source) = self.source.take() else {
            return;
        };
        self.worker.spawn(
            SOURCE,
            Category::Power,
            supervisor,
            move |supervisor, stop| {
                let mut last: Option<PowerStatus> = None;
                let mut last_error: Option<String> = None;
                while !stop.wait_timeout(SAMPLE_INTERVAL) {
                    match source.sample() {
                        Ok(status) => {
                            last_error = None;
                            if last.as_ref() == Some(&status) {
                                continue;
                            }
                            let mut event = record(
                                SOURCE,
                                Category::Power,
                                Severity::Info,
                                "Power status changed",
                            );
                            event.set_attribute("ACLineStatus", &status.ac_state);
                            event.set_attribute("BatteryFlag", &status.battery_flags);
                            event.set_attribute(
                                "BatteryLifePercent",
                                status
                                    .battery_percent
                                    .map_or_else(|| "255".to_string(), |pct| pct.to_string()),
                            );
                            supervisor.emit(event);

                            if let Some(scheme) = &status.scheme {
                                let mut scheme_event = record(
                                    SOURCE,
                                    Category::Power,
                                    Severity::Info,
                                    "Active power scheme",
                                );
                                scheme_event.set_attribute("Guid", scheme);
                                supervisor.emit(scheme_event);
                            }
                            last = Some(status);
                        },
                        Err(err) => {
                            let message = err.to_string();
                            if last_error.as_deref() != Some(&message) {
                                let mut failure = record(
                                    SOURCE,
                                    Category::Power,
                                    Severity::Warning,
                                    "Power status query failed",
                                );
                                failure.set_attribute("error", &message);
                                supervisor.emit(failure);
                                last_error = Some(message);
                            }
                        },
                    }
                }
            },
        );
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_source_reads_fake_tree() {
        let dir = tempfile::tempdir().unwrap();
        let ac = dir.path().join("AC0");
        fs::create_dir(&ac).unwrap();
        fs::write(ac.join("type"), "Mains\n").unwrap();
        fs::write(ac.join("online"), "1\n").unwrap();
        let battery = dir.path().join("BAT0");
        fs::create_dir(&battery).unwrap();
        fs::write(battery.join("type"), "Battery\n").unwrap();
        fs::write(battery.join("capacity"), "87\n").unwrap();
        fs::write(battery.join("status"), "Discharging\n").unwrap();

        let mut source = SysfsPowerSource::with_path(dir.path());
        let status = source.sample().unwrap();
        assert_eq!(status.ac_state, "Online");
        assert_eq!(status.battery_percent, Some(87));
        assert_eq!(status.battery_flags, "Discharging");
    }

    #[test]
    fn test_sysfs_source_without_battery() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = SysfsPowerSource::with_path(dir.path());
        let status = source.sample().unwrap();
        assert_eq!(status.battery_flags, "NoBattery");
        assert_eq!(status.battery_percent, None);
    }
}
