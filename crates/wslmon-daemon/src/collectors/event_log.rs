//! Structured platform event-log tail.
//!
//! Iterates a fixed list of log channels; for each channel only records
//! newer than the largest record id seen so far are emitted, with the
//! platform level mapped onto the fabric's severity scale and the record
//! id carried as the event `sequence`.
//!
//! The default source polls each channel with `Get-WinEvent` through
//! `powershell.exe` (native on the host, interop from the guest), using
//! an `EventRecordID` XPath gate so only records past the high-water
//! mark cross the process boundary.

use std::io;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

const SOURCE: &str = "eventlog.tail";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on records fetched per channel per poll.
const MAX_EVENTS_PER_POLL: usize = 64;

/// One structured log record.
#[derive(Debug, Clone, Default)]
pub struct EventLogRecord {
    /// Monotonic per-channel record id.
    pub record_id: u64,
    /// Provider event id, 0 when unknown.
    pub event_id: u32,
    /// Platform level byte.
    pub level: u8,
    /// Rendered record body.
    pub message: String,
}

/// One watched channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel path.
    pub name: String,
    /// Friendly display name; empty to omit.
    pub display_name: String,
}

impl ChannelConfig {
    /// Creates a channel entry.
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
        }
    }
}

/// A source of structured log records.
pub trait EventLogSource: Send {
    /// Returns records from `channel` with ids strictly greater than
    /// `after_record_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the channel cannot be read.
    fn poll(&mut self, channel: &str, after_record_id: u64) -> io::Result<Vec<EventLogRecord>>;
}

/// Polls channels through `Get-WinEvent` via `powershell.exe`.
pub struct PowerShellEventLogSource {
    command: String,
    max_events: usize,
}

impl PowerShellEventLogSource {
    /// Source over the platform PowerShell.
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("powershell.exe")
    }

    /// Source over an injected shell command (tests use a stub script).
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            max_events: MAX_EVENTS_PER_POLL,
        }
    }
}

impl Default for PowerShellEventLogSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLogSource for PowerShellEventLogSource {
    fn poll(&mut self, channel: &str, after_record_id: u64) -> io::Result<Vec<EventLogRecord>> {
        // Single quotes in a channel name are doubled for the PowerShell
        // string literal.
        let channel = channel.replace('\'', "''");
        let script = format!(
            "Get-WinEvent -LogName '{channel}' -Oldest -MaxEvents {max} \
             -FilterXPath '*[System[EventRecordID > {after_record_id}]]' \
             -ErrorAction SilentlyContinue | \
             Select-Object RecordId,Id,Level,Message | ConvertTo-Json -Compress",
            max = self.max_events,
        );
        let output = Command::new(&self.command)
            .args(["-NoProfile", "-NonInteractive", "-Command", &script])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "event log query exited with {}",
                output.status
            )));
        }
        Ok(parse_winevent_json(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses the `ConvertTo-Json` output of one channel poll. An empty
/// channel yields no output at all; a single record serialises as a bare
/// object rather than an array.
pub(crate) fn parse_winevent_json(json: &str) -> Vec<EventLogRecord> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Vec::new();
    };
    let items: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        object @ serde_json::Value::Object(_) => vec![object],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| {
            let record_id = item.get("RecordId").and_then(serde_json::Value::as_u64)?;
            #[allow(clippy::cast_possible_truncation)]
            let event_id = item
                .get("Id")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u32;
            #[allow(clippy::cast_possible_truncation)]
            let level = item
                .get("Level")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u8;
            let message = item
                .get("Message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(EventLogRecord {
                record_id,
                event_id,
                level,
                message,
            })
        })
        .collect()
}

/// Maps the platform level enum onto the fabric severity scale.
#[must_use]
pub fn level_to_severity(level: u8) -> Severity {
    match level {
        1 => Severity::Critical,
        2 => Severity::Error,
        3 => Severity::Warning,
        5 => Severity::Verbose,
        _ => Severity::Info,
    }
}

/// The channels the original deployment tails.
#[must_use]
pub fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new("System", "Windows System"),
        ChannelConfig::new("Application", "Windows Application"),
        ChannelConfig::new("Microsoft-Windows-Hyper-V-Worker-Admin", "Hyper-V Worker"),
        ChannelConfig::new("Microsoft-Windows-Hyper-V-Compute-Admin", "Hyper-V Compute"),
        ChannelConfig::new(
            "Microsoft-Windows-Hyper-V-VmSwitch-Operational",
            "Hyper-V vSwitch",
        ),
        ChannelConfig::new("Microsoft-Windows-Lxss/Operational", "WSL Runtime"),
        ChannelConfig::new("Microsoft-Windows-Lxss-Client/Operational", "WSL Client"),
        ChannelConfig::new("Microsoft-Windows-Subsys-Linux/Operational", "WSL Subsystem"),
        ChannelConfig::new("Microsoft-Windows-Winlogon/Operational", "Winlogon"),
        ChannelConfig::new(
            "Microsoft-Windows-Windows Firewall With Advanced Security/Firewall",
            "Firewall",
        ),
        ChannelConfig::new("Microsoft-Windows-Windows Defender/Operational", "Defender"),
        ChannelConfig::new(
            "Microsoft-Windows-WER-SystemErrorReporting/Operational",
            "WER System",
        ),
    ]
}

/// Event-log tail collector.
pub struct EventLogCollector {
    channels: Vec<ChannelConfig>,
    source: Option<Box<dyn EventLogSource>>,
    worker: WorkerHandle,
}

impl EventLogCollector {
    /// Collector over `Get-WinEvent` and the default channel list.
    #[must_use]
    pub fn new() -> Self {
        Self::powershell(default_channels())
    }

    /// Collector over `Get-WinEvent` for the given channels.
    #[must_use]
    pub fn powershell(channels: Vec<ChannelConfig>) -> Self {
        Self::with_source(Box::new(PowerShellEventLogSource::new()), channels)
    }

    /// Collector over an injected source and channel list.
    pub fn with_source(source: Box<dyn EventLogSource>, channels: Vec<ChannelConfig>) -> Self {
        Self {
            channels,
            source: Some(source),
            worker: WorkerHandle::new(),
        }
    }
}

impl Default for EventLogCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for EventLogCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(source) = self.source.take() else {
            return;
        };
        let channels = self.channels.clone();
        self.worker.spawn(
            SOURCE,
            Category::EventLog,
            supervisor,
            move |supervisor, stop| run(source, channels, supervisor, stop),
        );
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

struct ChannelState {
    config: ChannelConfig,
    last_record_id: u64,
}

fn run(
    mut source: Box<dyn EventLogSource>,
    channels: Vec<ChannelConfig>,
    supervisor: &Arc<Supervisor>,
    stop: &StopSignal,
) {
    let mut states: Vec<ChannelState> = channels
        .into_iter()
        .map(|config| ChannelState {
            config,
            last_record_id: 0,
        })
        .collect();

    while !stop.wait_timeout(POLL_INTERVAL) {
        for state in &mut states {
            // Unreadable channels are skipped quietly; not every channel
            // exists on every installation.
            let Ok(records) = source.poll(&state.config.name, state.last_record_id) else {
                continue;
            };
            for log_record in records {
                if log_record.record_id == 0 || log_record.record_id <= state.last_record_id {
                    continue;
                }
                state.last_record_id = log_record.record_id;

                let severity = level_to_severity(log_record.level);
                let mut event =
                    record(SOURCE, Category::EventLog, severity, log_record.message);
                event.sequence = log_record.record_id;
                event.set_attribute("channel", &state.config.name);
                if !state.config.display_name.is_empty() {
                    event.set_attribute("channel_display", &state.config.display_name);
                }
                event.set_attribute("record_id", log_record.record_id.to_string());
                if log_record.event_id != 0 {
                    event.set_attribute("event_id", log_record.event_id.to_string());
                }
                event.set_attribute("level", log_record.level.to_string());
                supervisor.emit(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_to_severity(1), Severity::Critical);
        assert_eq!(level_to_severity(2), Severity::Error);
        assert_eq!(level_to_severity(3), Severity::Warning);
        assert_eq!(level_to_severity(4), Severity::Info);
        assert_eq!(level_to_severity(5), Severity::Verbose);
        assert_eq!(level_to_severity(0), Severity::Info);
    }

    #[test]
    fn test_parse_winevent_json_array() {
        let json = "[{\"RecordId\":101,\"Id\":7001,\"Level\":3,\"Message\":\"service hang\"},\
                    {\"RecordId\":102,\"Id\":41,\"Level\":1,\"Message\":\"unexpected reboot\"}]";
        let records = parse_winevent_json(json);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_id, 101);
        assert_eq!(records[0].event_id, 7001);
        assert_eq!(records[0].level, 3);
        assert_eq!(records[1].message, "unexpected reboot");
    }

    #[test]
    fn test_parse_winevent_json_single_object_and_nulls() {
        // A single record serialises as a bare object; Message can be null.
        let records = parse_winevent_json("{\"RecordId\":7,\"Id\":1,\"Level\":4,\"Message\":null}");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, 7);
        assert_eq!(records[0].message, "");
    }

    #[test]
    fn test_parse_winevent_json_tolerates_garbage() {
        assert!(parse_winevent_json("").is_empty());
        assert!(parse_winevent_json("No events were found").is_empty());
        assert!(parse_winevent_json("[{\"Id\":1}]").is_empty());
    }

    #[test]
    fn test_default_channels_cover_the_virtualisation_stack() {
        let channels = default_channels();
        assert_eq!(channels.len(), 12);
        assert!(channels
            .iter()
            .any(|channel| channel.name.contains("Lxss/Operational")));
        assert!(channels.iter().any(|channel| channel.name == "System"));
    }
}
