//! wg-wardenctl - Operator console for a running wg-warden
//!
//! Usage:
//!   wg-wardenctl list                                  - All peers and their state
//!   wg-wardenctl status alice                          - One peer with live statistics
//!   wg-wardenctl enable alice --for 30d --quota 50G    - Unblock with new limits
//!   wg-wardenctl disable alice                         - Block without touching limits
//!   wg-wardenctl set-quota alice 10GiB                 - Reset usage under a new limit
//!   wg-wardenctl set-expiry alice 2026-12-31T00:00:00Z - Replace the expiry
//!   wg-wardenctl delete alice                          - Remove the peer

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use wg_warden::control::{self, Request, Response};
use wg_warden::engine::PeerStatus;
use wg_warden::expiry::parse_timestamp;
use wg_warden::types::{Lifetime, Quota};

/// WireGuard peer warden control tool
#[derive(Parser)]
#[command(name = "wg-wardenctl")]
#[command(about = "Manage peer time and traffic limits", long_about = None)]
struct Cli {
    /// Control socket of the running daemon
    #[arg(short, long, default_value = "/run/wg-warden/control.sock")]
    socket: PathBuf,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all peers
    List,
    /// Show one peer including live daemon statistics
    Status { peer: String },
    /// Unblock a peer, optionally with a new expiry and/or quota
    Enable {
        peer: String,
        /// Expire after this long (e.g. 30d, 12h)
        #[arg(long = "for", value_name = "DURATION", value_parser = parse_duration, conflicts_with_all = ["until", "unlimited"])]
        for_: Option<Duration>,
        /// Expire at this instant (ISO-8601)
        #[arg(long, value_parser = parse_until, conflicts_with = "unlimited")]
        until: Option<DateTime<Utc>>,
        /// Remove the time limit
        #[arg(long)]
        unlimited: bool,
        /// New traffic limit (e.g. 10G, 512MiB); usage restarts from zero
        #[arg(long, value_name = "SIZE", value_parser = parse_limit, conflicts_with = "unlimited_quota")]
        quota: Option<u64>,
        /// Remove the traffic limit
        #[arg(long)]
        unlimited_quota: bool,
    },
    /// Block a peer without touching its limits
    Disable { peer: String },
    /// Assign a traffic limit, reset usage and unblock
    SetQuota {
        peer: String,
        /// SIZE or "unlimited"
        #[arg(value_parser = parse_quota)]
        quota: Quota,
    },
    /// Replace a peer's expiry
    SetExpiry {
        peer: String,
        /// DURATION from now, ISO-8601 instant, or "unlimited"
        #[arg(value_parser = parse_lifetime)]
        expiry: Lifetime,
    },
    /// Remove a peer from the config and forget its limits
    Delete { peer: String },
}

/// Parse `90s`, `15m`, `12h`, `30d`, `2w`; a bare number is seconds
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        other => return Err(format!("unknown duration unit '{}'", other)),
    };

    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", value))
}

/// Parse `100`, `512K`, `10G`, `10GB`, `1TiB` as binary multiples of bytes
fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    let unit = unit.trim().to_ascii_uppercase();
    let unit = unit
        .strip_suffix("IB")
        .or_else(|| unit.strip_suffix('B'))
        .unwrap_or(&unit);
    let shift = match unit {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        other => return Err(format!("unknown size unit '{}'", other)),
    };

    amount
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{}' is too large", value))
}

/// A byte limit; zero is rejected since a limit of zero means unlimited on disk
fn parse_limit(value: &str) -> Result<u64, String> {
    match parse_size(value)? {
        0 => Err("a traffic limit must be above zero; use 'unlimited' for none".to_string()),
        bytes => Ok(bytes),
    }
}

fn parse_until(value: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(value).ok_or_else(|| format!("invalid timestamp '{}'", value))
}

fn parse_quota(value: &str) -> Result<Quota, String> {
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(Quota::Unlimited);
    }
    parse_limit(value).map(Quota::Bytes)
}

fn parse_lifetime(value: &str) -> Result<Lifetime, String> {
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(Lifetime::Unlimited);
    }
    if let Some(at) = parse_timestamp(value) {
        return Ok(Lifetime::Until(at));
    }
    let duration = parse_duration(value)?;
    Ok(Lifetime::Until(Utc::now() + duration_to_chrono(duration)?))
}

fn duration_to_chrono(duration: Duration) -> Result<chrono::Duration, String> {
    chrono::Duration::from_std(duration).map_err(|e| format!("duration out of range: {}", e))
}

/// Combine the mutually exclusive expiry flags of `enable`
fn enable_lifetime(
    for_: Option<Duration>,
    until: Option<DateTime<Utc>>,
    unlimited: bool,
) -> Result<Option<Lifetime>, String> {
    if unlimited {
        return Ok(Some(Lifetime::Unlimited));
    }
    if let Some(at) = until {
        return Ok(Some(Lifetime::Until(at)));
    }
    match for_ {
        Some(duration) => Ok(Some(Lifetime::Until(Utc::now() + duration_to_chrono(duration)?))),
        None => Ok(None),
    }
}

fn enable_quota(quota: Option<u64>, unlimited_quota: bool) -> Option<Quota> {
    if unlimited_quota {
        Some(Quota::Unlimited)
    } else {
        quota.map(Quota::Bytes)
    }
}

/// Human-readable binary size
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn format_quota(status: &PeerStatus) -> String {
    match &status.quota {
        None => "-".to_string(),
        Some(entry) => match entry.limit {
            Some(limit) => format!("{} / {}", format_bytes(entry.used), format_bytes(limit)),
            None => format!("{} / unlimited", format_bytes(entry.used)),
        },
    }
}

fn format_expiry(status: &PeerStatus) -> String {
    status
        .expires_at
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn print_peers(peers: &[PeerStatus]) {
    println!(
        "{:20} {:16} {:30} {:22}",
        "PEER", "STATE", "TRAFFIC", "EXPIRES"
    );
    println!("{}", "-".repeat(88));
    for peer in peers {
        println!(
            "{:20} {:16} {:30} {:22}",
            peer.name,
            peer.state.as_str(),
            format_quota(peer),
            format_expiry(peer)
        );
    }
}

fn print_status(status: &PeerStatus) {
    println!("Peer:        {}", status.name);
    println!("State:       {}", status.state.as_str());
    if let Some(ips) = &status.allowed_ips {
        println!("Allowed IPs: {}", ips);
    }
    println!("Traffic:     {}", format_quota(status));
    println!("Expires:     {}", format_expiry(status));

    match &status.live {
        Some(live) => {
            println!(
                "Endpoint:    {}",
                live.endpoint.as_deref().unwrap_or("(none)")
            );
            let handshake = live
                .latest_handshake
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
                .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!("Handshake:   {}", handshake);
            println!(
                "Transfer:    {} received, {} sent",
                format_bytes(live.rx_bytes),
                format_bytes(live.tx_bytes)
            );
        }
        None => println!("Live stats:  not reported by the daemon"),
    }
}

fn build_request(command: Commands) -> Result<Request> {
    Ok(match command {
        Commands::List => Request::List,
        Commands::Status { peer } => Request::Status { peer },
        Commands::Enable {
            peer,
            for_,
            until,
            unlimited,
            quota,
            unlimited_quota,
        } => Request::Enable {
            peer,
            expiry: enable_lifetime(for_, until, unlimited).map_err(anyhow::Error::msg)?,
            quota: enable_quota(quota, unlimited_quota),
        },
        Commands::Disable { peer } => Request::Disable { peer },
        Commands::SetQuota { peer, quota } => Request::SetQuota { peer, quota },
        Commands::SetExpiry { peer, expiry } => Request::SetExpiry { peer, expiry },
        Commands::Delete { peer } => Request::Delete { peer },
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let request = build_request(cli.command)?;

    let response = control::request(&cli.socket, &request)
        .await
        .with_context(|| {
            format!(
                "Failed to reach wg-warden at {:?}. Is the service running?",
                cli.socket
            )
        })?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        if let Response::Error { .. } = response {
            std::process::exit(1);
        }
        return Ok(());
    }

    match response {
        Response::Peers { peers } => print_peers(&peers),
        Response::Status(status) => print_status(&status),
        Response::Deleted { peer } => println!("Deleted peer {}", peer),
        Response::Error { message } => anyhow::bail!(message),
    }

    Ok(())
}
