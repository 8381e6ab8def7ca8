//! Service state sampler.
//!
//! Every five seconds a static list of platform services is queried for
//! state, process id, and exit codes; a record is emitted only when a
//! field differs from the last sampled value. A process-id change
//! promotes the record to Warning with the message
//! `"Service process changed"`.

use std::collections::HashMap;
use std::io;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use wslmon_core::event::{Category, EventRecord, Severity};

use super::{record, Collector, WorkerHandle};
use crate::stop::StopSignal;
use crate::supervisor::Supervisor;

const SOURCE: &str = "service.health";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Current state text (e.g. `"Running"`, `"activating (auto-restart)"`).
    pub state: String,
    /// Main process id, 0 when not running.
    pub pid: u32,
    /// Service exit code, 0 when clean.
    pub exit_code: i64,
    /// Service-specific exit code, 0 when unused.
    pub service_exit_code: i64,
}

/// A source of service status snapshots.
pub trait ServiceStateSource: Send {
    /// Queries the current status of `service`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the service manager cannot answer.
    fn query(&mut self, service: &str) -> io::Result<ServiceStatus>;
}

/// Queries systemd units through `systemctl show`.
pub struct SystemctlShowSource;

impl ServiceStateSource for SystemctlShowSource {
    fn query(&mut self, service: &str) -> io::Result<ServiceStatus> {
        let output = Command::new("systemctl")
            .args([
                "show",
                service,
                "--property=ActiveState,SubState,MainPID,ExecMainStatus",
            ])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "systemctl exited with {}",
                output.status
            )));
        }
        Ok(parse_systemctl_show(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Queries Windows services through `sc.exe queryex` (native on the
/// host, interop from the guest).
pub struct ScQueryServiceSource {
    command: String,
}

impl ScQueryServiceSource {
    /// Source over the platform `sc.exe`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("sc.exe")
    }

    /// Source over an injected command (tests use a stub script).
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for ScQueryServiceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStateSource for ScQueryServiceSource {
    fn query(&mut self, service: &str) -> io::Result<ServiceStatus> {
        let output = Command::new(&self.command)
            .args(["queryex", service])
            .output()?;
        // sc.exe fails outright for unknown services, which the callers
        // surface as "service unavailable".
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "sc queryex exited with {}",
                output.status
            )));
        }
        Ok(parse_sc_queryex(&String::from_utf8_lossy(&output.stdout)))
    }
}

pub(crate) fn parse_sc_queryex(output: &str) -> ServiceStatus {
    let mut state_code = 0u32;
    let mut pid = 0u32;
    let mut exit_code = 0i64;
    let mut service_exit_code = 0i64;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let first = value.split_whitespace().next().unwrap_or_default();
        match key.trim() {
            "STATE" => state_code = first.parse().unwrap_or(0),
            "PID" => pid = first.parse().unwrap_or(0),
            "WIN32_EXIT_CODE" => exit_code = first.parse().unwrap_or(0),
            "SERVICE_EXIT_CODE" => service_exit_code = first.parse().unwrap_or(0),
            _ => {},
        }
    }
    ServiceStatus {
        state: sc_state_text(state_code),
        pid,
        exit_code,
        service_exit_code,
    }
}

fn sc_state_text(code: u32) -> String {
    match code {
        1 => "Stopped",
        2 => "StartPending",
        3 => "StopPending",
        4 => "Running",
        5 => "ContinuePending",
        6 => "PausePending",
        7 => "Paused",
        _ => return code.to_string(),
    }
    .to_string()
}

pub(crate) fn parse_systemctl_show(output: &str) -> ServiceStatus {
    let mut active = String::new();
    let mut sub = String::new();
    let mut pid = 0u32;
    let mut exit_code = 0i64;
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "ActiveState" => active = value.to_string(),
            "SubState" => sub = value.to_string(),
            "MainPID" => pid = value.parse().unwrap_or(0),
            "ExecMainStatus" => exit_code = value.parse().unwrap_or(0),
            _ => {},
        }
    }
    let state = if sub.is_empty() {
        active
    } else {
        format!("{active} ({sub})")
    };
    ServiceStatus {
        state,
        pid,
        exit_code,
        service_exit_code: 0,
    }
}

/// Service state collector.
pub struct ServiceStateCollector {
    services: Vec<String>,
    source: Option<Box<dyn ServiceStateSource>>,
    worker: WorkerHandle,
}

impl ServiceStateCollector {
    /// Collector over an injected source and service list.
    pub fn new(source: Box<dyn ServiceStateSource>, services: Vec<String>) -> Self {
        Self {
            services,
            source: Some(source),
            worker: WorkerHandle::new(),
        }
    }

    /// Collector over `systemctl show` for the given units.
    #[must_use]
    pub fn systemd(services: Vec<String>) -> Self {
        Self::new(Box::new(SystemctlShowSource), services)
    }
}

impl Collector for ServiceStateCollector {
    fn name(&self) -> &'static str {
        SOURCE
    }

    fn start(&mut self, supervisor: &Arc<Supervisor>) {
        let Some(source) = self.source.take() else {
            return;
        };
        let services = self.services.clone();
        self.worker.spawn(
            SOURCE,
            Category::ServiceHealth,
            supervisor,
            move |supervisor, stop| run(source, &services, supervisor, stop),
        );
    }

    fn stop(&mut self) {
        self.worker.stop();
    }
}

fn run(
    mut source: Box<dyn ServiceStateSource>,
    services: &[String],
    supervisor: &Arc<Supervisor>,
    stop: &StopSignal,
) {
    let mut last_states: HashMap<String, Option<ServiceStatus>> = HashMap::new();
    while !stop.wait_timeout(SAMPLE_INTERVAL) {
        for service in services {
            match source.query(service) {
                Ok(status) => {
                    let previous = last_states.get(service).cloned().flatten();
                    let changed = previous.as_ref() != Some(&status);
                    if changed {
                        supervisor.emit(status_record(service, &status, previous.as_ref()));
                        last_states.insert(service.clone(), Some(status));
                    }
                },
                Err(err) => {
                    // Emit once per failure episode, not per poll.
                    let was_failing =
                        matches!(last_states.get(service), Some(None));
                    if !was_failing {
                        let mut failure = record(
                            SOURCE,
                            Category::ServiceHealth,
                            Severity::Warning,
                            "Unable to query service",
                        );
                        failure.set_attribute("service", service);
                        failure.set_attribute("error", err.to_string());
                        supervisor.emit(failure);
                        last_states.insert(service.clone(), None);
                    }
                },
            }
        }
    }
}

fn status_record(
    service: &str,
    status: &ServiceStatus,
    previous: Option<&ServiceStatus>,
) -> EventRecord {
    let mut event = record(
        SOURCE,
        Category::ServiceHealth,
        Severity::Info,
        "Service state",
    );
    event.set_attribute("service", service);
    event.set_attribute("state", &status.state);
    event.set_attribute("pid", status.pid.to_string());
    if status.exit_code != 0 {
        event.set_attribute("exit_code", status.exit_code.to_string());
    }
    if status.service_exit_code != 0 {
        event.set_attribute("service_exit_code", status.service_exit_code.to_string());
    }
    if let Some(previous) = previous {
        event.set_attribute("previous_state", &previous.state);
        if previous.pid != status.pid {
            event.severity = Severity::Warning;
            event.message = "Service process changed".to_string();
            event.set_attribute("previous_pid", previous.pid.to_string());
        }
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_systemctl_show() {
        let status = parse_systemctl_show(
            "ActiveState=activating\nSubState=auto-restart\nMainPID=412\nExecMainStatus=1\n",
        );
        assert_eq!(status.state, "activating (auto-restart)");
        assert_eq!(status.pid, 412);
        assert_eq!(status.exit_code, 1);
    }

    #[test]
    fn test_parse_sc_queryex() {
        let output = "\
SERVICE_NAME: CSFalconService
        TYPE               : 10  WIN32_OWN_PROCESS
        STATE              : 4  RUNNING
                                (STOPPABLE, NOT_PAUSABLE, ACCEPTS_SHUTDOWN)
        WIN32_EXIT_CODE    : 0  (0x0)
        SERVICE_EXIT_CODE  : 0  (0x0)
        CHECKPOINT         : 0x0
        WAIT_HINT          : 0x0
        PID                : 3656
        FLAGS              :
";
        let status = parse_sc_queryex(output);
        assert_eq!(status.state, "Running");
        assert_eq!(status.pid, 3656);
        assert_eq!(status.exit_code, 0);
        assert_eq!(status.service_exit_code, 0);
    }

    #[test]
    fn test_parse_sc_queryex_stopped_with_exit_code() {
        let output = "\
SERVICE_NAME: SentinelAgent
        STATE              : 1  STOPPED
        WIN32_EXIT_CODE    : 1067  (0x42b)
        SERVICE_EXIT_CODE  : 0  (0x0)
        PID                : 0
";
        let status = parse_sc_queryex(output);
        assert_eq!(status.state, "Stopped");
        assert_eq!(status.pid, 0);
        assert_eq!(status.exit_code, 1067);
    }

    #[test]
    fn test_sc_state_text_unknown_code_passes_through() {
        let status = parse_sc_queryex("        STATE              : 9  ODD\n");
        assert_eq!(status.state, "9");
    }

    #[test]
    fn test_parse_systemctl_show_defaults() {
        let status = parse_systemctl_show("ActiveState=inactive\nMainPID=abc\n");
        assert_eq!(status.state, "inactive");
        assert_eq!(status.pid, 0);
    }

    #[test]
    fn test_pid_change_promotes_to_warning() {
        let previous = ServiceStatus {
            state: "Running".to_string(),
            pid: 100,
            exit_code: 0,
            service_exit_code: 0,
        };
        let current = ServiceStatus {
            state: "Running".to_string(),
            pid: 200,
            exit_code: 0,
            service_exit_code: 0,
        };
        let event = status_record("vmcompute", &current, Some(&previous));
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.message, "Service process changed");
        assert_eq!(event.attribute("previous_pid"), Some("100"));
        assert_eq!(event.attribute("pid"), Some("200"));
    }

    #[test]
    fn test_state_change_stays_info() {
        let previous = ServiceStatus {
            state: "Running".to_string(),
            pid: 100,
            exit_code: 0,
            service_exit_code: 0,
        };
        let current = ServiceStatus {
            state: "Stopped".to_string(),
            pid: 100,
            exit_code: 3,
            service_exit_code: 0,
        };
        let event = status_record("vmcompute", &current, Some(&previous));
        assert_eq!(event.severity, Severity::Info);
        assert_eq!(event.attribute("exit_code"), Some("3"));
        assert_eq!(event.attribute("previous_state"), Some("Running"));
    }
}
