//! Per-peer transfer counters
//!
//! Queries every interface the daemon manages and maps the reported public
//! keys to peer names through the config's peer blocks. A failed query yields
//! an empty mapping, never partial data: a reconciliation tick fed with it
//! is a no-op instead of corrupting deltas.

use crate::daemon::{Daemon, PeerStats};
use crate::error::Result;
use crate::peer_config::key_index;
use std::collections::HashMap;

/// Cumulative bytes the daemon reports for one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub received: u64,
    pub sent: u64,
}

impl Transfer {
    /// Received plus sent
    pub fn total(&self) -> u64 {
        self.received.saturating_add(self.sent)
    }
}

/// Peer name -> cumulative transfer, summed across interfaces
pub type TransferTotals = HashMap<String, Transfer>;

/// Fetch totals for every named peer; any query failure returns an empty map
pub async fn fetch_transfer_totals<D: Daemon + ?Sized>(daemon: &D, config_text: &str) -> TransferTotals {
    match try_fetch_transfer_totals(daemon, config_text).await {
        Ok(totals) => totals,
        Err(e) => {
            log::warn!("Failed to fetch transfer counters, skipping this pass: {}", e);
            TransferTotals::new()
        }
    }
}

/// Like [`fetch_transfer_totals`] but reports the failure
pub async fn try_fetch_transfer_totals<D: Daemon + ?Sized>(
    daemon: &D,
    config_text: &str,
) -> Result<TransferTotals> {
    let index = key_index(config_text);
    let mut totals = TransferTotals::new();

    for interface in daemon.interfaces().await? {
        let peers = daemon.peers(&interface).await?;
        accumulate(&mut totals, &index, &peers);
    }

    Ok(totals)
}

/// Add one interface's peers into `totals`; unknown keys are ignored
fn accumulate(totals: &mut TransferTotals, index: &HashMap<String, String>, peers: &[PeerStats]) {
    for peer in peers {
        if let Some(name) = index.get(&peer.public_key) {
            let entry = totals.entry(name.clone()).or_default();
            entry.received = entry.received.saturating_add(peer.rx_bytes);
            entry.sent = entry.sent.saturating_add(peer.tx_bytes);
        }
    }
}

/// Live statistics for one peer, from the first interface that reports its key
pub async fn fetch_peer_stats<D: Daemon + ?Sized>(
    daemon: &D,
    config_text: &str,
    name: &str,
) -> Option<PeerStats> {
    let key = key_index(config_text)
        .into_iter()
        .find_map(|(key, peer)| (peer == name).then_some(key))?;

    let interfaces = match daemon.interfaces().await {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::warn!("Failed to list interfaces for {}: {}", name, e);
            return None;
        }
    };

    for interface in interfaces {
        match daemon.peers(&interface).await {
            Ok(peers) => {
                if let Some(stats) = peers.into_iter().find(|p| p.public_key == key) {
                    return Some(stats);
                }
            }
            Err(e) => log::warn!("Failed to query peers on {}: {}", interface, e),
        }
    }

    None
}
