//! wslmon-report - offline post-mortem fusion of the host and guest
//! journals.
//!
//! Reads both journal files, replays each line, merges the two streams
//! into one timestamp-ordered timeline, and emits a single JSON document
//! with per-origin chain summaries, the cross-channel health snapshot,
//! the heuristic insights, and the fully merged event list.
//!
//! A missing input file is a warning, not a failure: a post-mortem often
//! has only one surviving side.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use wslmon_core::analyzer::{self, HealthSnapshot, Insight, TimelineEvent};
use wslmon_core::event::format_timestamp;
use wslmon_core::journal::{read_journal_file, JournalLine};

/// wslmon-report - unified host/guest post-mortem report
#[derive(Parser, Debug)]
#[command(name = "wslmon-report")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Host-side journal file
    #[arg(long)]
    host_log: Option<PathBuf>,

    /// Guest-side journal file
    #[arg(long)]
    guest_log: Option<PathBuf>,

    /// Write the report here instead of standard output
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn host_log(&self) -> PathBuf {
        self.host_log.clone().unwrap_or_else(|| {
            if cfg!(windows) {
                PathBuf::from("C:/ProgramData/WslMonitor/host-events.log")
            } else {
                PathBuf::from("/mnt/c/ProgramData/WslMonitor/host-events.log")
            }
        })
    }

    fn guest_log(&self) -> PathBuf {
        self.guest_log.clone().unwrap_or_else(|| {
            if cfg!(windows) {
                PathBuf::from("C:/ProgramData/WslMonitor/guest-events.log")
            } else {
                PathBuf::from("/var/log/wsl-monitor/guest-events.log")
            }
        })
    }
}

/// Per-origin summary of one journal file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OriginSummary {
    log_path: String,
    final_chain_hash: String,
    event_count: usize,
}

/// The full report document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    generated_at: String,
    host: OriginSummary,
    guest: OriginSummary,
    health: HealthSnapshot,
    insights: Vec<Insight>,
    events: Vec<TimelineEvent>,
}

/// Loads one journal; a missing or unreadable file yields an empty
/// stream and a warning.
fn load_log(path: &Path, origin: &str) -> Vec<JournalLine> {
    match read_journal_file(path) {
        Ok(lines) => lines,
        Err(err) => {
            warn!(origin, path = %path.display(), %err, "unable to load journal");
            Vec::new()
        },
    }
}

fn final_chain_hash(lines: &[JournalLine]) -> String {
    lines
        .last()
        .map(|line| line.chain_hash.clone())
        .unwrap_or_default()
}

fn build_report(
    host_path: &Path,
    guest_path: &Path,
    host_lines: Vec<JournalLine>,
    guest_lines: Vec<JournalLine>,
) -> Report {
    let host = OriginSummary {
        log_path: host_path.display().to_string(),
        final_chain_hash: final_chain_hash(&host_lines),
        event_count: host_lines.len(),
    };
    let guest = OriginSummary {
        log_path: guest_path.display().to_string(),
        final_chain_hash: final_chain_hash(&guest_lines),
        event_count: guest_lines.len(),
    };

    let events = analyzer::build_timeline(host_lines, guest_lines);
    Report {
        generated_at: format_timestamp(Utc::now()),
        host,
        guest,
        health: analyzer::compute_snapshot(&events),
        insights: analyzer::analyze(&events),
        events,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new("warn").unwrap_or_default())
        .init();

    let cli = Cli::parse();
    let host_path = cli.host_log();
    let guest_path = cli.guest_log();

    let host_lines = load_log(&host_path, "host");
    let guest_lines = load_log(&guest_path, "guest");
    let report = build_report(&host_path, &guest_path, host_lines, guest_lines);

    let body = serde_json::to_string_pretty(&report).context("serialising report")?;
    match &cli.output {
        Some(path) => std::fs::write(path, body + "\n")
            .with_context(|| format!("writing report to {}", path.display()))?,
        None => println!("{body}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use wslmon_core::event::{Category, EventRecord, Severity};
    use wslmon_core::journal::{Journal, JournalOptions};

    use super::*;

    fn journal_with(dir: &Path, name: &str, records: Vec<EventRecord>) -> PathBuf {
        let path = dir.join(name);
        let journal = Journal::open(
            JournalOptions::new(&path)
                .default_source("test")
                .hmac_key(None),
        )
        .unwrap();
        for record in records {
            journal.append(&record).unwrap();
        }
        path
    }

    fn record_at(
        category: Category,
        severity: Severity,
        message: &str,
        timestamp: &str,
    ) -> EventRecord {
        let mut record = EventRecord::new(category, severity, message);
        record.timestamp = wslmon_core::event::parse_timestamp(timestamp).unwrap();
        record
    }

    #[test]
    fn test_report_fuses_both_journals() {
        let dir = tempfile::tempdir().unwrap();
        let host_path = journal_with(
            dir.path(),
            "host.log",
            vec![
                record_at(
                    Category::ServiceHealth,
                    Severity::Warning,
                    "Service state",
                    "2024-06-01T12:00:00.000000Z",
                ),
                record_at(
                    Category::Kernel,
                    Severity::Critical,
                    "bugcheck recorded",
                    "2024-06-01T12:02:00.000000Z",
                ),
            ],
        );
        let guest_path = journal_with(
            dir.path(),
            "guest.log",
            vec![record_at(
                Category::Resource,
                Severity::Info,
                "pressure stall metrics rising",
                "2024-06-01T12:01:00.000000Z",
            )],
        );

        let host_lines = read_journal_file(&host_path).unwrap();
        let guest_lines = read_journal_file(&guest_path).unwrap();
        let report = build_report(&host_path, &guest_path, host_lines, guest_lines);

        assert_eq!(report.host.event_count, 2);
        assert_eq!(report.guest.event_count, 1);
        assert_eq!(report.host.final_chain_hash.len(), 64);
        assert_eq!(report.health.host.total, 2);
        assert_eq!(report.health.guest.total, 1);

        // Merged order is by timestamp across origins.
        let messages: Vec<&str> = report
            .events
            .iter()
            .map(|event| event.record.message.as_str())
            .collect();
        assert_eq!(
            messages,
            vec![
                "Service state",
                "pressure stall metrics rising",
                "bugcheck recorded"
            ]
        );

        // Kernel fault and memory pressure rules both fire.
        let ids: Vec<&str> = report
            .insights
            .iter()
            .map(|insight| insight.id.as_str())
            .collect();
        assert_eq!(ids, vec!["kernel_fault_chain", "memory_pressure_correlation"]);

        // The document serialises with the expected top-level fields.
        let json = serde_json::to_string_pretty(&report).unwrap();
        for field in [
            "\"generatedAt\"",
            "\"host\"",
            "\"guest\"",
            "\"health\"",
            "\"insights\"",
            "\"events\"",
            "\"finalChainHash\"",
        ] {
            assert!(json.contains(field), "report JSON missing {field}");
        }
    }

    #[test]
    fn test_missing_journal_is_empty_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.log");
        let lines = load_log(&missing, "host");
        assert!(lines.is_empty());
        let report = build_report(&missing, &missing, Vec::new(), Vec::new());
        assert_eq!(report.host.event_count, 0);
        assert_eq!(report.host.final_chain_hash, "");
        assert!(report.insights.is_empty());
    }
}
