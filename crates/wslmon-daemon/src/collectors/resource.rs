//! Resource utilisation sampler.
//!
//! Every five seconds: CPU usage from the `/proc/stat` delta, memory from
//! `/proc/meminfo` (1 - available/total), root filesystem usage via
//! `statvfs`. One Info record per sample with `cpu`, `mem`, and
//! `disk_root` attributes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const SOURCE: &str = "resource.monitor";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Cumulative CPU jiffies from the aggregate `cpu` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CpuSample {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
}

pub(crate) fn parse_cpu_sample(stat: &str) -> Option<CpuSample> {
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let mut parse = || fields.next()?.parse::<u64>().ok();
    Some(CpuSample {
        user: parse()?,
        nice: parse()?,
        system: parse()?,
        idle: parse()?,
        iowait: parse()?,
        irq: parse()?,
        softirq: parse()?,
    })
}

pub(crate) fn cpu_usage_percent(previous: CpuSample, current: CpuSample) -> f64 {
    let previous_idle = previous.idle + previous.iowait;
    let current_idle = current.idle + current.iowait;
    let previous_total = previous_idle
        + previous.user
        + previous.nice
        + previous.system
        + previous.irq
        + previous.softirq;
    let current_total =
        current_idle + current.user + current.nice + current.system + current.irq + current.softirq;
    let total_delta = current_total.saturating_sub(previous_total);
    let idle_delta = current_idle.saturating_sub(previous_idle);
    if total_delta == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        (total_delta - idle_delta) as f64 / total_delta as f64 * 100.0
    }
}

pub(crate) fn memory_used_percent(meminfo: &str) -> Option<f64> {
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total = fields.next()?.parse().ok()?,
            Some("MemAvailable:") => available = fields.next()?.parse().ok()?,
            _ => {},
        }
    }
    if total == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    Some((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}

fn root_disk_percent(path: &Path) -> Option<f64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
    {
        let total = stat.blocks() as f64 * stat.fragment_size() as f64;
        let available = stat.blocks_available() as f64 * stat.fragment_size() as f64;
        if total <= 0.0 {
            return None;
        }
        Some((total - available) / total * 100.0)
    }
}

/// Resource utilisation collector.
pub struct ResourceCollector {
    stat_path: PathBuf,
    meminfo_path: PathBuf,
    root_path: PathBuf,
    worker: WorkerHandle,
}

impl ResourceCollector {
    /// Collector over the live `/proc` and `/`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_paths("/proc/stat", "/proc/meminfo", "/")
    }

    /// Collector over injected paths (tests point these at fixtures).
    pub fn with_paths(
        stat_path: impl Into<PathBuf>,
        meminfo_path: impl Into<PathBuf>,
        root_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stat_path: stat_path.into(),
            meminfo_path: meminfo_path.into(),
            root_path: root_path.into(),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for ResourceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ResourceCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let stat_path = self.stat_path.clone();
        let meminfo_path = self.meminfo_path.clone();
        let root_path = self.root_path.clone();
        self.worker.spawn(
            SOURCE,
            Category::Resource,
            supervisor,
            move |supervisor, stop| {
                let read_cpu = || {
                    fs::read_to_string(&stat_path)
                        .ok()
                        .as_deref()
                        .and_then(parse_cpu_sample)
                };

                let mut previous = read_cpu();
                if previous.is_none() {
                    supervisor.emit(record(
                        SOURCE,
                        Category::Resource,
                        Severity::Warning,
                        "Unable to read initial CPU sample",
                    ));
                }

                while !stop.wait_timeout(SAMPLE_INTERVAL) {
                    let Some(current) = read_cpu() else { continue };
                    let cpu = previous.map_or(0.0, |prev| cpu_usage_percent(prev, current));
                    previous = Some(current);

                    let mem = fs::read_to_string(&meminfo_path)
                        .ok()
                        .as_deref()
                        .and_then(memory_used_percent)
                        .unwrap_or(0.0);
                    let disk = root_disk_percent(&root_path).unwrap_or(0.0);

                    let mut sample = record(
                        SOURCE,
                        Category::Resource,
                        Severity::Info,
                        "Resource utilization",
                    );
                    sample.set_attribute("cpu", format!("{cpu:.2}"));
                    sample.set_attribute("mem", format!("{mem:.2}"));
                    sample.set_attribute("disk_root", format!("{disk:.2}"));
                    supervisor.emit(sample);
                }
            },
        );
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}
