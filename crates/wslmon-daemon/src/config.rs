//! Daemon configuration.
//!
//! TOML-backed with full defaults: an empty file (or no file at all)
//! yields a working guest-side daemon. The `side` selects the origin tag
//! and the platform-default paths; individual collectors toggle on and
//! off independently. The guest-side signal set is on by default; the
//! host-oriented samplers (services, process, security posture, event
//! log, artifacts, power, diagnostics) are switched on by the host
//! deployment's config.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collectors::artifacts::WatchedDirectory;
use crate::collectors::diagnostics::DiagnosticProbe;
use crate::collectors::event_log::ChannelConfig;
use wslmon_core::event::Category;
use wslmon_core::journal::DEFAULT_MAX_SEGMENT_BYTES;

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which side of the fabric this daemon runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The Windows host.
    Host,
    /// The Linux guest.
    #[default]
    Guest,
}

impl Side {
    /// Origin tag journalled with every record and stamped as
    /// `peer_origin` on records forwarded to the other side.
    #[must_use]
    pub const fn origin(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.origin())
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Which side this daemon serves.
    pub side: Side,
    /// Journal settings.
    pub journal: JournalSettings,
    /// Bridge settings.
    pub bridge: BridgeSettings,
    /// Collector toggles and tuning.
    pub collectors: CollectorSettings,
}

/// Journal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    /// Active segment path; defaults to the side's install location.
    pub path: Option<PathBuf>,
    /// Default record source; defaults to `wslmon.<side>`.
    pub default_source: Option<String>,
    /// Rotation threshold in bytes.
    pub max_segment_bytes: u64,
    /// In-memory ring capacity.
    pub ring_capacity: usize,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            path: None,
            default_source: None,
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            ring_capacity: 1024,
        }
    }
}

/// Bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Whether the bridge runs at all.
    pub enabled: bool,
    /// Listening endpoint for the peer; defaults per side.
    pub listen_socket: Option<PathBuf>,
    /// Outbound endpoint of the peer's listener; defaults per side.
    pub connect_path: Option<PathBuf>,
    /// Pre-shared secret file; defaults per side.
    pub secret_path: Option<PathBuf>,
    /// Reconnect back-off.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_socket: None,
            connect_path: None,
            secret_path: None,
            backoff: crate::bridge::DEFAULT_BACKOFF,
        }
    }
}

/// One configured diagnostic probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Program to execute.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Message on the emitted record.
    pub message: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            message: "Diagnostic probe".to_string(),
        }
    }
}

/// Collector toggles and tuning lists.
///
/// The guest-side signal set is on by default; the host-oriented
/// samplers are opted into by the host deployment's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Kernel ring tail.
    pub kmsg: bool,
    /// System journal tail.
    pub journal_tail: bool,
    /// CPU/memory/disk sampler.
    pub resources: bool,
    /// Pressure stall sampler.
    pub pressure: bool,
    /// Crash dump directory watcher.
    pub crash_watch: bool,
    /// Failed unit poller.
    pub unit_failures: bool,
    /// Interface counter watcher.
    pub network: bool,
    /// Service state sampler.
    pub services: bool,
    /// Tracked process sampler.
    pub process: bool,
    /// Security posture sampler.
    pub security: bool,
    /// Structured event-log tail.
    pub event_log: bool,
    /// Crash-artifact directory watcher.
    pub artifacts: bool,
    /// Power status poller.
    pub power: bool,
    /// Diagnostic command probes.
    pub diagnostics: bool,

    /// Crash dump directory.
    pub crash_directory: PathBuf,
    /// Service units sampled by the service state collector; empty means
    /// the built-in virtualisation stack list.
    pub service_units: Vec<String>,
    /// Process names tracked by the process sampler; empty means the
    /// built-in virtualisation helper list.
    pub process_names: Vec<String>,
    /// Event-log channels tailed by the event-log collector; empty means
    /// the built-in channel list.
    pub event_log_channels: Vec<String>,
    /// Artifact directories; empty means the built-in list.
    pub artifact_directories: Vec<PathBuf>,
    /// Diagnostic probes; empty means the built-in list.
    pub probes: Vec<ProbeSettings>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            kmsg: true,
            journal_tail: true,
            resources: true,
            pressure: true,
            crash_watch: true,
            unit_failures: true,
            network: true,
            services: false,
            process: false,
            security: false,
            event_log: false,
            artifacts: false,
            power: false,
            diagnostics: false,
            crash_directory: PathBuf::from("/var/crash"),
            service_units: Vec::new(),
            process_names: Vec::new(),
            event_log_channels: Vec::new(),
            artifact_directories: Vec::new(),
            probes: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Active journal segment path.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.journal.path.clone().unwrap_or_else(|| match self.side {
            Side::Host => PathBuf::from("C:/ProgramData/WslMonitor/host-events.log"),
            Side::Guest => PathBuf::from("/var/log/wsl-monitor/guest-events.log"),
        })
    }

    /// Default record source.
    #[must_use]
    pub fn default_source(&self) -> String {
        self.journal
            .default_source
            .clone()
            .unwrap_or_else(|| format!("wslmon.{}", self.side.origin()))
    }

    /// Listening endpoint for the peer.
    #[must_use]
    pub fn listen_socket(&self) -> PathBuf {
        self.bridge
            .listen_socket
            .clone()
            .unwrap_or_else(|| match self.side {
                Side::Host => PathBuf::from("C:/ProgramData/WslMonitor/bridge.sock"),
                Side::Guest => PathBuf::from("/run/wsl-monitor/bridge.sock"),
            })
    }

    /// Outbound endpoint of the peer's listener.
    #[must_use]
    pub fn connect_path(&self) -> PathBuf {
        self.bridge
            .connect_path
            .clone()
            .unwrap_or_else(|| match self.side {
                Side::Host => PathBuf::from("C:/ProgramData/WslMonitor/guest-bridge.sock"),
                Side::Guest => PathBuf::from("/mnt/wsl/wsl-monitor/host-bridge.pipe"),
            })
    }

    /// Pre-shared secret file.
    #[must_use]
    pub fn secret_path(&self) -> PathBuf {
        self.bridge
            .secret_path
            .clone()
            .unwrap_or_else(|| match self.side {
                Side::Host => PathBuf::from("C:/ProgramData/WslMonitor/ipc.key"),
                Side::Guest => PathBuf::from("/etc/wsl-monitor/ipc.key"),
            })
    }

    /// Sampled service units.
    #[must_use]
    pub fn service_units(&self) -> Vec<String> {
        if self.collectors.service_units.is_empty() {
            ["LxssManager", "LxssManagerUser", "vmcompute", "vmms"]
                .into_iter()
                .map(ToString::to_string)
                .collect()
        } else {
            self.collectors.service_units.clone()
        }
    }

    /// Tracked process names.
    #[must_use]
    pub fn process_names(&self) -> Vec<String> {
        if self.collectors.process_names.is_empty() {
            ["wsl.exe", "wslhost.exe", "vmmem", "vmmemWSL", "vmwp.exe"]
                .into_iter()
                .map(ToString::to_string)
                .collect()
        } else {
            self.collectors.process_names.clone()
        }
    }

    /// Tailed event-log channels.
    #[must_use]
    pub fn event_log_channels(&self) -> Vec<ChannelConfig> {
        if self.collectors.event_log_channels.is_empty() {
            crate::collectors::event_log::default_channels()
        } else {
            self.collectors
                .event_log_channels
                .iter()
                .map(|name| ChannelConfig::new(name.clone(), ""))
                .collect()
        }
    }

    /// Watched artifact directories.
    #[must_use]
    pub fn artifact_directories(&self) -> Vec<WatchedDirectory> {
        if self.collectors.artifact_directories.is_empty() {
            crate::collectors::artifacts::default_directories()
        } else {
            self.collectors
                .artifact_directories
                .iter()
                .map(|path| WatchedDirectory::new(path.clone(), Category::Wer))
                .collect()
        }
    }

    /// Configured diagnostic probes.
    #[must_use]
    pub fn probes(&self) -> Vec<DiagnosticProbe> {
        if self.collectors.probes.is_empty() {
            crate::collectors::diagnostics::default_probes()
        } else {
            self.collectors
                .probes
                .iter()
                .filter(|probe| !probe.command.is_empty())
                .map(|probe| {
                    DiagnosticProbe::new(
                        probe.command.clone(),
                        probe.args.clone(),
                        probe.message.clone(),
                    )
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults_to_guest() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.side, Side::Guest);
        assert!(config.bridge.enabled);
        assert!(config.collectors.kmsg);
        assert!(!config.collectors.services);
        assert!(!config.collectors.security);
        assert!(!config.collectors.event_log);
        assert_eq!(
            config.journal_path(),
            PathBuf::from("/var/log/wsl-monitor/guest-events.log")
        );
        assert_eq!(config.default_source(), "wslmon.guest");
        assert_eq!(config.bridge.backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_host_side_defaults() {
        let config: DaemonConfig = toml::from_str("side = \"host\"").unwrap();
        assert_eq!(config.side, Side::Host);
        assert_eq!(
            config.journal_path(),
            PathBuf::from("C:/ProgramData/WslMonitor/host-events.log")
        );
        assert_eq!(config.default_source(), "wslmon.host");
        assert_eq!(config.service_units(), vec![
            "LxssManager",
            "LxssManagerUser",
            "vmcompute",
            "vmms"
        ]);
    }

    #[test]
    fn test_partial_override() {
        let config: DaemonConfig = toml::from_str(
            "side = \"guest\"\n\
             [journal]\n\
             path = \"/tmp/test.log\"\n\
             ring_capacity = 64\n\
             [bridge]\n\
             enabled = false\n\
             backoff = \"500ms\"\n\
             [collectors]\n\
             network = false\n\
             process_names = [\"init\"]\n",
        )
        .unwrap();
        assert_eq!(config.journal_path(), PathBuf::from("/tmp/test.log"));
        assert_eq!(config.journal.ring_capacity, 64);
        assert!(!config.bridge.enabled);
        assert_eq!(config.bridge.backoff, Duration::from_millis(500));
        assert!(!config.collectors.network);
        assert!(config.collectors.kmsg);
        assert_eq!(config.process_names(), vec!["init"]);
    }

    #[test]
    fn test_event_log_channels_default_and_override() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        let channels = config.event_log_channels();
        assert_eq!(channels.len(), 12);
        assert!(channels.iter().any(|channel| channel.name == "System"));

        let config: DaemonConfig = toml::from_str(
            "[collectors]\n\
             event_log = true\n\
             event_log_channels = [\"Application\"]\n",
        )
        .unwrap();
        assert!(config.collectors.event_log);
        let channels = config.event_log_channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "Application");
        assert_eq!(channels[0].display_name, "");
    }

    #[test]
    fn test_probe_settings_filter_empty_commands() {
        let config: DaemonConfig = toml::from_str(
            "[collectors]\n\
             [[collectors.probes]]\n\
             command = \"uname\"\n\
             args = [\"-a\"]\n\
             message = \"kernel identity\"\n\
             [[collectors.probes]]\n\
             message = \"broken probe\"\n",
        )
        .unwrap();
        let probes = config.probes();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].command, "uname");
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(DaemonConfig::load(Path::new("/nonexistent/wslmon.toml")).is_err());
    }
}
