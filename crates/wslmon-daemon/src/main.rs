//! wslmond - the per-side monitor daemon.
//!
//! Opens the journal, registers the configured collectors, attaches the
//! IPC bridge, and runs until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wslmon_core::journal::{Journal, JournalOptions};
use wslmon_daemon::bridge::BridgeConfig;
use wslmon_daemon::collectors::{
    ArtifactCollector, CrashWatchCollector, DiagnosticsCollector, EventLogCollector,
    JournalTailCollector, KmsgCollector, NetworkCollector, PowerCollector, PressureCollector,
    ProcessCollector, ResourceCollector, SecurityCollector, ServiceStateCollector,
    UnitFailureCollector,
};
use wslmon_daemon::config::{DaemonConfig, Side};
use wslmon_daemon::supervisor::{HostIdentity, Supervisor};
use wslmon_daemon::transport::{Connector, PipeConnector, UnixAcceptor, UnixConnector};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// wslmond - host/guest observability monitor daemon
#[derive(Parser, Debug)]
#[command(name = "wslmond")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match &cli.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    let journal = Journal::open(
        JournalOptions::new(config.journal_path())
            .default_source(config.default_source())
            .max_segment_bytes(config.journal.max_segment_bytes),
    )
    .context("opening event journal")?;

    let supervisor = Supervisor::new(journal, config.journal.ring_capacity, HostIdentity::detect());
    register_collectors(&supervisor, &config);

    if config.bridge.enabled {
        match UnixAcceptor::bind(config.listen_socket()) {
            Ok(acceptor) => {
                supervisor.attach_bridge(BridgeConfig {
                    origin: config.side.origin().to_string(),
                    secret_path: config.secret_path(),
                    acceptor: Box::new(acceptor),
                    connector: connector_for(&config),
                    backoff: config.bridge.backoff,
                });
            },
            Err(err) => {
                warn!(%err, "bridge listener unavailable, continuing without peer link");
            },
        }
    }

    install_signal_handlers()?;
    supervisor.start();
    info!(side = %config.side, journal = %config.journal_path().display(), "wslmond running");

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutdown requested");
    supervisor.stop();
    Ok(())
}

fn register_collectors(supervisor: &Arc<Supervisor>, config: &DaemonConfig) {
    let collectors = &config.collectors;
    if collectors.kmsg {
        supervisor.register(Box::new(KmsgCollector::new()));
    }
    if collectors.journal_tail {
        supervisor.register(Box::new(JournalTailCollector::new()));
    }
    if collectors.resources {
        supervisor.register(Box::new(ResourceCollector::new()));
    }
    if collectors.pressure {
        supervisor.register(Box::new(PressureCollector::new()));
    }
    if collectors.crash_watch {
        supervisor.register(Box::new(CrashWatchCollector::new(
            collectors.crash_directory.clone(),
        )));
    }
    if collectors.unit_failures {
        supervisor.register(Box::new(UnitFailureCollector::new()));
    }
    if collectors.network {
        supervisor.register(Box::new(NetworkCollector::new()));
    }
    if collectors.services {
        supervisor.register(Box::new(ServiceStateCollector::systemd(
            config.service_units(),
        )));
    }
    if collectors.process {
        supervisor.register(Box::new(ProcessCollector::procfs(config.process_names())));
    }
    if collectors.security {
        supervisor.register(Box::new(SecurityCollector::new()));
    }
    if collectors.event_log {
        supervisor.register(Box::new(EventLogCollector::powershell(
            config.event_log_channels(),
        )));
    }
    if collectors.artifacts {
        supervisor.register(Box::new(ArtifactCollector::new(
            config.artifact_directories(),
        )));
    }
    if collectors.power {
        supervisor.register(Box::new(PowerCollector::new()));
    }
    if collectors.diagnostics {
        supervisor.register(Box::new(DiagnosticsCollector::new(config.probes())));
    }
}

/// The guest connects to the host's projected pipe path; the host
/// connects to the guest's stream socket.
fn connector_for(config: &DaemonConfig) -> Box<dyn Connector> {
    match config.side {
        Side::Guest => Box::new(PipeConnector::new(config.connect_path())),
        Side::Host => Box::new(UnixConnector::new(config.connect_path())),
    }
}

fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic flag, which is
    // async-signal-safe.
    unsafe {
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }
    Ok(())
}
