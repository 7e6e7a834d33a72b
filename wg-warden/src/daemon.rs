// Tunnel daemon control-plane adapter

//! Tunnel daemon control-plane
//!
//! This module wraps the read operations (interfaces, per-peer statistics)
//! and the mutating pair (strip / syncconf) of a WireGuard or AmneziaWG
//! daemon behind the [`Daemon`] trait. Every external call is bounded by a
//! timeout and surfaces as [`Error::DaemonCallFailed`] on any failure.

use crate::error::{Error, Result};
use crate::types::{CounterBackend, Flavor};
use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use wireguard_control::{Backend, Device, InterfaceName};

/// Live statistics the daemon reports for one peer on one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: String,
    pub endpoint: Option<String>,
    /// Unix seconds of the latest handshake, `None` if never
    pub latest_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Operations the warden needs from the tunnel daemon
#[async_trait]
pub trait Daemon: Send + Sync + 'static {
    /// Interfaces the daemon currently manages
    async fn interfaces(&self) -> Result<Vec<String>>;

    /// Peers of one interface, keyed by public key
    async fn peers(&self, interface: &str) -> Result<Vec<PeerStats>>;

    /// Render the config file as the daemon would apply it (no wg-quick-only directives)
    async fn strip(&self, config_file: &Path) -> Result<String>;

    /// Apply a stripped config to a running interface without dropping unrelated sessions
    async fn syncconf(&self, interface: &str, stripped: &Path) -> Result<()>;
}

/// Controller that shells out to `wg`/`awg` and `wg-quick`/`awg-quick`
pub struct DaemonCtl {
    tool: &'static str,
    quick_tool: &'static str,
    counters: CounterBackend,
    timeout: Duration,
}

impl DaemonCtl {
    /// Create a controller for a resolved flavor (`Auto` is treated as WireGuard)
    pub fn new(flavor: Flavor, counters: CounterBackend, timeout: Duration) -> Self {
        let (tool, quick_tool) = match flavor {
            Flavor::Awg => ("awg", "awg-quick"),
            Flavor::Wg | Flavor::Auto => ("wg", "wg-quick"),
        };
        Self {
            tool,
            quick_tool,
            counters,
            timeout,
        }
    }

    /// Name of the main control tool (`wg` or `awg`)
    pub fn tool(&self) -> &str {
        self.tool
    }

    /// Run a command to completion within the timeout and return its stdout
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = format!("{} {}", program, args.join(" "));
        log::debug!("Running: {}", command);

        let child = Command::new(program).args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| Error::daemon(&command, format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::daemon(&command, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::daemon(
                command,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a blocking netlink query on the blocking pool, bounded by the timeout
    async fn netlink<T, F>(&self, what: &str, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(query);
        tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| Error::daemon(what, format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::daemon(what, format!("netlink task panicked: {}", e)))?
            .map_err(|e| Error::daemon(what, e))
    }

    /// Parse `<tool> show <interface> dump` output into per-peer statistics
    ///
    /// The first line describes the interface itself and is skipped; its
    /// field count differs between WireGuard and AmneziaWG. Peer lines are
    /// `pubkey psk endpoint allowed-ips handshake rx tx keepalive`.
    #[doc(hidden)]
    pub fn parse_dump(output: &str) -> Vec<PeerStats> {
        output
            .lines()
            .skip(1)
            .filter_map(|line| {
                let parts: Vec<&str> = line.split('\t').collect();
                if parts.len() < 8 {
                    return None;
                }
                let rx = parts[5].parse::<u64>().ok()?;
                let tx = parts[6].parse::<u64>().ok()?;
                let endpoint = match parts[2] {
                    "(none)" | "" => None,
                    endpoint => Some(endpoint.to_string()),
                };
                let latest_handshake = match parts[4].parse::<u64>() {
                    Ok(0) | Err(_) => None,
                    Ok(secs) => Some(secs),
                };
                Some(PeerStats {
                    public_key: parts[0].to_string(),
                    endpoint,
                    latest_handshake,
                    rx_bytes: rx,
                    tx_bytes: tx,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Daemon for DaemonCtl {
    async fn interfaces(&self) -> Result<Vec<String>> {
        if self.counters == CounterBackend::Netlink {
            let names = self
                .netlink("netlink list interfaces", || Device::list(Backend::Kernel))
                .await?;
            return Ok(names.iter().map(|name| name.to_string()).collect());
        }

        let output = self.run(self.tool, &["show", "interfaces"]).await?;
        Ok(output.split_whitespace().map(str::to_string).collect())
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PeerStats>> {
        if self.counters == CounterBackend::Netlink {
            let iface_name: InterfaceName = interface
                .parse()
                .map_err(|e| Error::daemon("netlink get device", format!("{}: {:?}", interface, e)))?;

            let device = self
                .netlink("netlink get device", move || {
                    Device::get(&iface_name, Backend::Kernel)
                })
                .await?;

            return Ok(device
                .peers
                .into_iter()
                .map(|peer| PeerStats {
                    public_key: peer.config.public_key.to_base64(),
                    endpoint: peer.config.endpoint.map(|addr| addr.to_string()),
                    latest_handshake: peer
                        .stats
                        .last_handshake_time
                        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs()),
                    rx_bytes: peer.stats.rx_bytes,
                    tx_bytes: peer.stats.tx_bytes,
                })
                .collect());
        }

        let output = self.run(self.tool, &["show", interface, "dump"]).await?;
        Ok(Self::parse_dump(&output))
    }

    async fn strip(&self, config_file: &Path) -> Result<String> {
        let path = config_file.to_string_lossy();
        self.run(self.quick_tool, &["strip", &path]).await
    }

    async fn syncconf(&self, interface: &str, stripped: &Path) -> Result<()> {
        let path = stripped.to_string_lossy();
        self.run(self.tool, &["syncconf", interface, &path]).await?;
        log::info!("Resynced {} from {}", interface, path);
        Ok(())
    }
}
