//! vmusb agent
//!
//! Daemon that keeps a VM's USB passthrough set in sync with the host.
//! Connects to the hypervisor's QMP endpoint, watches the host bus for
//! hot-plug events, polls VM reachability, and drives the reconciler.

use agent::vm::monitor;
use agent::{DeviceWatcher, MtpGuard, QmpVmController, Reconciler, SystemTools};
use anyhow::{Context, Result};
use clap::Parser;
use common::{
    DesiredStateStore, EventBus, IdentityResolver, JsonFileStore, LsusbProbe, UsbIdDatabase,
    setup_logging,
};
use qmp::QmpClient;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "vmusb-agent")]
#[command(
    author,
    version,
    about = "USB passthrough agent - sync host USB devices into a VM"
)]
struct Args {
    /// QMP endpoint host
    #[arg(long, value_name = "HOST", default_value = "127.0.0.1")]
    qmp_host: String,

    /// QMP endpoint port
    #[arg(long, value_name = "PORT", default_value_t = 4444)]
    qmp_port: u16,

    /// Settings document holding the desired passthrough list
    #[arg(long, value_name = "PATH")]
    state_file: Option<PathBuf>,

    /// Bundled usb.ids fallback (used when the system copy is missing)
    #[arg(long, value_name = "PATH")]
    usb_ids: Option<PathBuf>,

    /// Reachability poll interval in seconds
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    poll_interval: u64,

    /// Attempts for the initial QMP connection (doubling backoff)
    #[arg(long, value_name = "N", default_value_t = 10)]
    connect_attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

fn default_state_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vmusb")
        .join("settings.json")
}

/// Connect with doubling backoff. The protocol client itself never
/// retries; that policy lives here with the caller.
async fn connect_with_retry(host: &str, port: u16, attempts: u32) -> Result<QmpClient> {
    let attempts = attempts.max(1);
    let mut delay = Duration::from_millis(500);
    for attempt in 1..=attempts {
        match QmpClient::connect(host, port).await {
            Ok(client) => {
                info!(host, port, "connected to QMP endpoint");
                return Ok(client);
            }
            Err(err) if attempt < attempts => {
                warn!(host, port, attempt, %err, "QMP connection failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to connect to QMP endpoint {host}:{port} after {attempts} attempts")
                });
            }
        }
    }
    unreachable!("attempts is at least 1")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level).context("Failed to setup logging")?;

    info!("vmusb-agent v{}", env!("CARGO_PKG_VERSION"));

    let database =
        UsbIdDatabase::load(args.usb_ids.as_deref()).context("Failed to load USB id database")?;

    let state_file = args.state_file.unwrap_or_else(default_state_file);
    let store = JsonFileStore::open(&state_file)
        .with_context(|| format!("Failed to open state file {}", state_file.display()))?;
    info!(
        path = %state_file.display(),
        desired = store.entries().len(),
        "desired passthrough list loaded"
    );

    let client = connect_with_retry(&args.qmp_host, args.qmp_port, args.connect_attempts).await?;
    let controller = QmpVmController::new(client.clone()).await;

    let watcher = DeviceWatcher::new().context("Failed to initialize USB watcher")?;

    let events = EventBus::new();
    let mut reconciler = Reconciler::new(
        controller,
        IdentityResolver::new(database, LsusbProbe),
        MtpGuard::new(SystemTools),
        store,
        events.clone(),
    );

    let snapshot = watcher
        .snapshot()
        .context("Failed to enumerate USB devices")?;
    info!(devices = snapshot.len(), "enumerated host USB devices");
    reconciler.prime(snapshot).await;

    let mut reachability = monitor::spawn(client, Duration::from_secs(args.poll_interval.max(1)));

    loop {
        tokio::select! {
            event = watcher.next_event() => {
                match event {
                    Ok(event) => {
                        let live = match watcher.snapshot() {
                            Ok(live) => live,
                            Err(err) => {
                                warn!(%err, "device enumeration failed, keeping previous list");
                                reconciler.devices().to_vec()
                            }
                        };
                        reconciler.on_hotplug(event, live).await;
                    }
                    Err(err) => {
                        error!(%err, "USB event channel closed");
                        break;
                    }
                }
            }
            changed = reachability.changed() => {
                match changed {
                    Ok(()) => {
                        let reachable = *reachability.borrow_and_update();
                        reconciler.on_reachability_changed(reachable).await;
                    }
                    Err(_) => {
                        error!("reachability monitor stopped");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
