// Shared types between the engine, the control socket and the binaries

//! Shared data structures
//!
//! This module defines data structures shared between components: the
//! observable peer states, the operator-supplied expiry and quota settings,
//! and the TOML configuration structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Externally observable peer states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Active,         // Config block enabled
    ExpiredBlocked, // Time limit reached, config blocked
    QuotaBlocked,   // Byte limit reached, config blocked
    Disabled,       // Blocked by an operator without a limit being reached
}

impl PeerState {
    /// Short lowercase label for status files and console output
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Active => "active",
            PeerState::ExpiredBlocked => "expired",
            PeerState::QuotaBlocked => "quota_exceeded",
            PeerState::Disabled => "disabled",
        }
    }
}

/// How long a peer may stay enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    Unlimited,
    Until(DateTime<Utc>),
}

impl Lifetime {
    /// The expiry instant, `None` for unlimited
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Lifetime::Unlimited => None,
            Lifetime::Until(at) => Some(*at),
        }
    }
}

/// How many bytes a peer may transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quota {
    Unlimited,
    Bytes(u64),
}

impl Quota {
    /// The byte limit, `None` for unlimited; a zero limit counts as unlimited
    pub fn limit(&self) -> Option<u64> {
        match self {
            Quota::Unlimited | Quota::Bytes(0) => None,
            Quota::Bytes(bytes) => Some(*bytes),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding the quota and expiry ledgers
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    /// Status snapshot for external monitoring, disabled when absent
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_dir: default_state_dir(),
            control_socket: default_control_socket(),
            status_file: None,
        }
    }
}

/// Tunnel daemon options
#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Daemon configuration file holding the `# BEGIN_PEER` blocks
    pub config_file: PathBuf,
    #[serde(default)]
    pub flavor: Flavor,
    #[serde(default)]
    pub counters: CounterBackend,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

/// Which tool family drives the daemon
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// AmneziaWG if the config path mentions "amnezia", WireGuard otherwise
    #[default]
    Auto,
    Wg,
    Awg,
}

/// Where transfer counters are read from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// `<tool> show <interface> dump`
    #[default]
    Cli,
    /// Kernel netlink (WireGuard only)
    Netlink,
}

/// Control loop timing
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/wg-warden")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/wg-warden/control.sock")
}

fn default_command_timeout() -> u64 {
    10
}

fn default_tick_interval() -> u64 {
    15
}

fn default_lock_timeout() -> u64 {
    30
}
