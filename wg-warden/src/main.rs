// WireGuard peer warden daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use wg_warden::{
    config::{self, load_config},
    control,
    daemon::{Daemon, DaemonCtl},
    engine::{Notification, Warden},
    expiry::ExpiryLedger,
    peer_config::PeerConfigStore,
    quota::QuotaLedger,
    state_file,
};

/// Size of the channel buffer for engine notifications
const NOTIFICATION_CHANNEL_SIZE: usize = 64;

#[derive(Parser)]
#[command(name = "wg-warden")]
#[command(about = "Time and traffic limits for WireGuard peers", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-warden/config.toml")]
    config: PathBuf,
}

/// Snapshot peer states for external monitoring
fn write_status<D: Daemon>(warden: &Warden<D>, path: &Path) {
    let peers = match warden.list_peers() {
        Ok(peers) => peers,
        Err(e) => {
            log::warn!("Failed to list peers for status file: {}", e);
            return;
        }
    };

    let states: Vec<_> = peers.into_iter().map(|p| (p.name, p.state)).collect();
    if let Err(e) = state_file::write_status(path, &states) {
        log::warn!("Failed to write status file: {}", e);
    }
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::BlockFailed { .. } => log::error!("{}", notification),
        _ => log::warn!("{}", notification),
    }
}

fn main() -> Result<()> {
    // Small fixed pool: one for the loop, one for control clients and process spawns
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-warden")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    log::info!("Starting wg-warden daemon");

    let flavor = config::resolve_flavor(&config);
    let interface = config::interface_name(&config.daemon.config_file)?;
    let daemon = Arc::new(DaemonCtl::new(
        flavor,
        config.daemon.counters,
        config::command_timeout(&config),
    ));

    log::info!("Daemon config: {:?}", config.daemon.config_file);
    log::info!("Interface: {} (tool: {})", interface, daemon.tool());
    log::info!("State directory: {:?}", config.general.state_dir);
    log::info!("Tick interval: {}s", config.schedule.tick_interval_secs);

    let store = PeerConfigStore::new(config.daemon.config_file.clone(), interface, daemon)
        .context("Failed to open daemon config")?;
    store.read().with_context(|| {
        format!("Daemon config {:?} is not readable", config.daemon.config_file)
    })?;

    let (notify_tx, mut notify_rx) = mpsc::channel::<Notification>(NOTIFICATION_CHANNEL_SIZE);
    let warden = Warden::new(
        store,
        QuotaLedger::load(config::quota_ledger_path(&config)),
        ExpiryLedger::load(config::expiry_ledger_path(&config)),
        config::lock_timeout(&config),
        notify_tx,
    );

    // Catch up on expiries that passed while stopped, re-arm the rest
    warden.recover().await;

    let listener = control::bind(&config.general.control_socket)
        .context("Failed to bind control socket")?;
    let mut control_handle = tokio::spawn(control::serve(listener, warden.clone()));

    let mut tick_timer = interval(Duration::from_secs(config.schedule.tick_interval_secs));
    tick_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    log::info!("Daemon started successfully");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }

            result = &mut control_handle => {
                match result {
                    Ok(()) => log::error!("Control server exited unexpectedly"),
                    Err(e) => log::error!("Control server panicked: {}", e),
                }
                anyhow::bail!("Control server terminated, aborting daemon for systemd restart");
            }

            Some(notification) = notify_rx.recv() => {
                log_notification(&notification);
            }

            _ = tick_timer.tick() => {
                // Runs in its own task so a slow daemon never stalls signals or notifications;
                // an overlapping tick is skipped by the engine
                let warden = warden.clone();
                let status_file = config.general.status_file.clone();
                tokio::spawn(async move {
                    if warden.tick().await {
                        if let Some(path) = status_file {
                            write_status(&warden, &path);
                        }
                    }
                });
            }
        }
    }

    log::info!("Shutting down gracefully...");
    warden.shutdown();
    control_handle.abort();
    state_file::cleanup(&config.general.control_socket);
    if let Some(path) = &config.general.status_file {
        state_file::cleanup(path);
    }
    log::info!("Shutdown complete");

    Ok(())
}
