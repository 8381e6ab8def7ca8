//! Pressure stall sampler.
//!
//! Every ten seconds the memory and CPU pressure files are parsed and the
//! `some`/`full` averages tested against fixed thresholds. Memory emits
//! when `some.avg10` exceeds 40 and has risen by more than 5 over the
//! previous sample, or `some.avg60` exceeds 30, or `full.avg10` exceeds
//! 5; CPU emits when `some.avg10` exceeds 60 or `full.avg10` exceeds 20.
//! Severity promotes to Critical at `some.avg10 > 60` or `full.avg10 >
//! 10` for memory and `some.avg10 > 80` for CPU.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, EventRecord, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const MEMORY_SOURCE: &str = "pressure.memory";
const CPU_SOURCE: &str = "pressure.cpu";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Averages from one `some` or `full` pressure line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct PressureReading {
    pub avg10: f64,
    pub avg60: f64,
    pub avg300: f64,
}

/// Parses a pressure file into its `some` and `full` readings.
pub(crate) fn parse_pressure(contents: &str) -> (PressureReading, PressureReading) {
    let mut some = PressureReading::default();
    let mut full = PressureReading::default();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let Some(scope) = fields.next() else { continue };
        let mut reading = PressureReading::default();
        for token in fields {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };
            match key {
                "avg10" => reading.avg10 = value,
                "avg60" => reading.avg60 = value,
                "avg300" => reading.avg300 = value,
                _ => {},
            }
        }
        match scope {
            "some" => some = reading,
            "full" => full = reading,
            _ => {},
        }
    }
    (some, full)
}

/// Memory emission decision against the previous sample.
pub(crate) fn evaluate_memory(
    some: PressureReading,
    full: PressureReading,
    last_some: PressureReading,
) -> Option<Severity> {
    let triggered = (some.avg10 > 40.0 && some.avg10 > last_some.avg10 + 5.0)
        || some.avg60 > 30.0
        || full.avg10 > 5.0;
    if !triggered {
        return None;
    }
    if some.avg10 > 60.0 || full.avg10 > 10.0 {
        Some(Severity::Critical)
    } else {
        Some(Severity::Warning)
    }
}

/// CPU emission decision.
pub(crate) fn evaluate_cpu(some: PressureReading, full: PressureReading) -> Option<Severity> {
    if some.avg10 > 60.0 || full.avg10 > 20.0 {
        if some.avg10 > 80.0 {
            Some(Severity::Critical)
        } else {
            Some(Severity::Warning)
        }
    } else {
        None
    }
}

fn pressure_record(
    source: &str,
    severity: Severity,
    message: &str,
    some: PressureReading,
    full: PressureReading,
) -> EventRecord {
    let mut event = record(source, Category::Pressure, severity, message);
    event.set_attribute("some_avg10", format!("{:.2}", some.avg10));
    event.set_attribute("some_avg60", format!("{:.2}", some.avg60));
    event.set_attribute("full_avg10", format!("{:.2}", full.avg10));
    event.set_attribute("full_avg60", format!("{:.2}", full.avg60));
    event
}

/// Pressure stall collector.
pub struct PressureCollector {
    memory_path: PathBuf,
    cpu_path: PathBuf,
    worker: WorkerHandle,
}

impl PressureCollector {
    /// Collector over the live `/proc/pressure` files.
    #[must_use]
    pub fn new() -> Self {
        Self::with_paths("/proc/pressure/memory", "/proc/pressure/cpu")
    }

    /// Collector over injected pressure files.
    pub fn with_paths(memory_path: impl Into<PathBuf>, cpu_path: impl Into<PathBuf>) -> Self {
        Self {
            memory_path: memory_path.into(),
            cpu_path: cpu_path.into(),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for PressureCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for PressureCollector {
    fn name(&self) -> &'static str {
        "pressure.stall"
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let memory_path = self.memory_path.clone();
        let cpu_path = self.cpu_path.clone();
        self.worker.spawn(
            "pressure.stall",
            Category::Pressure,
            supervisor,
            move |supervisor, stop| {
                let mut last_some = PressureReading::default();
                loop {
                    if let Ok(contents) = fs::read_to_string(&memory_path) {
                        let (some, full) = parse_pressure(&contents);
                        if let Some(severity) = evaluate_memory(some, full, last_some) {
                            supervisor.emit(pressure_record(
                                MEMORY_SOURCE,
                                severity,
                                "Memory pressure elevated",
                                some,
                                full,
                            ));
                        }
                        last_some = some;
                    }

                    if let Ok(contents) = fs::read_to_string(&cpu_path) {
                        let (some, full) = parse_pressure(&contents);
                        if let Some(severity) = evaluate_cpu(some, full) {
                            supervisor.emit(pressure_record(
                                CPU_SOURCE,
                                severity,
                                "CPU pressure sustained",
                                some,
                                full,
                            ));
                        }
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
