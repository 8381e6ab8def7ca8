//! Diagnostic command probes.
//!
//! Runs a configured list of status commands once a minute and emits a
//! record only when a probe's exit code or output changed since the
//! previous run. The default probes snapshot the virtualisation stack's
//! own status surface.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, Severity};

use super::{record, Collector, WorkerHandle};
use crate::supervisor::Supervisor;

const SOURCE: &str = "wsl.diagnostics";
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// One diagnostic probe.
#[derive(Debug, Clone)]
pub struct DiagnosticProbe {
    /// Program to execute.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Message used on the emitted record.
    pub message: String,
}

impl DiagnosticProbe {
    /// Creates a probe.
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            message: message.into(),
        }
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// Runs the probe; failures to spawn are folded into the outcome so
    /// change detection treats them like any other result.
    fn run(&self) -> (i32, String) {
        match Command::new(&self.command).args(&self.args).output() {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                (output.status.code().unwrap_or(-1), text)
            },
            Err(err) => (-1, err.to_string()),
        }
    }
}

/// The status probes the original deployment runs on the host side.
#[must_use]
pub fn default_probes() -> Vec<DiagnosticProbe> {
    vec![
        DiagnosticProbe::new(
            "wsl.exe",
            vec!["--status".to_string()],
            "WSL status snapshot",
        ),
        DiagnosticProbe::new(
            "wsl.exe",
            vec!["-l".to_string(), "-v".to_string()],
            "WSL distributions",
        ),
    ]
}

/// Diagnostic probe collector.
pub struct DiagnosticsCollector {
    probes: Vec<DiagnosticProbe>,
    worker: WorkerHandle,
}

impl DiagnosticsCollector {
    /// Collector over the given probes.
    #[must_use]
    pub fn new(probes: Vec<DiagnosticProbe>) -> Self {
        Self {
            probes,
            worker: WorkerHandle::new(),
        }
    }
}

impl Collector for DiagnosticsCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let probes = self.probes.clone();
        self.worker.spawn(
            SOURCE,
            Category::WslDiagnostics,
            supervisor,
            move |supervisor, stop| {
                let mut last_results: Vec<Option<(i32, String)>> =
                    probes.iter().map(|_| None).collect();
                loop {
                    for (index, probe) in probes.iter().enumerate() {
                        let result = probe.run();
                        if last_results[index].as_ref() == Some(&result) {
                            continue;
                        }
                        let (exit_code, output) = &result;
                        let severity = if *exit_code == 0 {
                            Severity::Info
                        } else {
                            Severity::Warning
                        };
                        let mut event = record(
                            SOURCE,
                            Category::WslDiagnostics,
                            severity,
                            probe.message.clone(),
                        );
                        event.set_attribute("command", probe.display());
                        event.set_attribute("exit_code", exit_code.to_string());
                        event.set_attribute("output", output);
                        supervisor.emit(event);
                        last_results[index] = Some(result);
                    }
                    if stop.wait_timeout(POLL_INTERVAL) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_runs_command() {
        let probe = DiagnosticProbe::new("echo", vec!["status ok".to_string()], "echo probe");
        let (exit_code, output) = probe.run();
        assert_eq!(exit_code, 0);
        assert_eq!(output.trim(), "status ok");
    }

    #[test]
    fn test_probe_missing_binary_folds_into_result() {
        let probe = DiagnosticProbe::new("/nonexistent/diag", vec![], "missing");
        let (exit_code, output) = probe.run();
        assert_eq!(exit_code, -1);
        assert!(!output.is_empty());
    }

    #[test]
    fn test_probe_display() {
        let probe = DiagnosticProbe::new("wsl.exe", vec!["--status".to_string()], "status");
        assert_eq!(probe.display(), "wsl.exe --status");
    }
}
