// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading TOML configuration files, validating their
//! contents, and deriving the values other components need (tool flavor,
//! interface name, ledger paths).

use crate::error::validate_name;
use crate::types::{Config, CounterBackend, Flavor};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the quota ledger inside `state_dir`
pub const QUOTA_LEDGER_FILE: &str = "traffic_limits.json";

/// File name of the expiry ledger inside `state_dir`
pub const EXPIRY_LEDGER_FILE: &str = "expirations.json";

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
    parse_config(&contents)
}

/// Parse and validate configuration text
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.daemon.config_file.as_os_str().is_empty() {
        anyhow::bail!("daemon.config_file cannot be empty");
    }

    let interface = interface_name(&config.daemon.config_file)?;
    validate_name(&interface).context("daemon.config_file stem is not a valid interface name")?;

    if config.daemon.command_timeout_secs == 0 {
        anyhow::bail!("daemon.command_timeout_secs must be > 0");
    }

    if config.schedule.tick_interval_secs == 0 {
        anyhow::bail!("schedule.tick_interval_secs must be > 0");
    }

    if config.schedule.lock_timeout_secs == 0 {
        anyhow::bail!("schedule.lock_timeout_secs must be > 0");
    }

    if config.daemon.counters == CounterBackend::Netlink && resolve_flavor(config) == Flavor::Awg
    {
        anyhow::bail!("counters = \"netlink\" is only supported for WireGuard, not AmneziaWG");
    }

    Ok(())
}

/// Interface name the daemon knows the config file by (`/etc/wireguard/wg0.conf` -> `wg0`)
pub fn interface_name(config_file: &Path) -> Result<String> {
    let stem = config_file
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("No file name in {:?}", config_file))?;

    // awg0.conf, but also a stray awg0.backup.conf
    let name = stem.split('.').next().unwrap_or(stem);
    Ok(name.to_string())
}

/// Concrete tool family, resolving `auto` from the config path
pub fn resolve_flavor(config: &Config) -> Flavor {
    match config.daemon.flavor {
        Flavor::Auto => {
            let path = config.daemon.config_file.to_string_lossy().to_lowercase();
            if path.contains("amnezia") {
                Flavor::Awg
            } else {
                Flavor::Wg
            }
        }
        flavor => flavor,
    }
}

/// Path of the quota ledger
pub fn quota_ledger_path(config: &Config) -> PathBuf {
    config.general.state_dir.join(QUOTA_LEDGER_FILE)
}

/// Path of the expiry ledger
pub fn expiry_ledger_path(config: &Config) -> PathBuf {
    config.general.state_dir.join(EXPIRY_LEDGER_FILE)
}

/// Timeout for a single external daemon command
pub fn command_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.daemon.command_timeout_secs)
}

/// Upper bound for waiting on a per-peer lock
pub fn lock_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.schedule.lock_timeout_secs)
}
