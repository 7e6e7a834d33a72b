//! Quota ledger
//!
//! Durable mapping of peer name to byte limit and usage. The daemon's
//! cumulative counters drop to zero whenever the daemon or interface
//! restarts, so usage only ever accumulates the positive delta between
//! successive observations; a negative delta adds nothing.
//!
//! Ticks must be applied in wall-clock order: the baseline is rolling, so a
//! stale total applied after a newer one would be read as a counter reset.

use crate::counters::TransferTotals;
use crate::error::{Error, Result};
use crate::state_file::write_atomic;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A byte count as found on disk; older writers stored some as strings
#[derive(Deserialize)]
#[serde(untagged)]
enum Count {
    Number(u64),
    Text(String),
}

impl Count {
    fn value<E: de::Error>(self) -> std::result::Result<u64, E> {
        match self {
            Count::Number(n) => Ok(n),
            Count::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid byte count {:?}", text))),
        }
    }
}

fn count<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    Count::deserialize(deserializer)?.value()
}

fn optional_count<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    Option::<Count>::deserialize(deserializer)?
        .map(Count::value)
        .transpose()
}

/// A zero limit on disk means unlimited
fn limit<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(optional_count(deserializer)?.filter(|&bytes| bytes > 0))
}

/// Byte limit and usage for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    /// `None` means unlimited
    #[serde(default, deserialize_with = "limit")]
    pub limit: Option<u64>,
    #[serde(default, deserialize_with = "count")]
    pub used: u64,
    /// Last cumulative total seen; `None` until the first observation
    #[serde(rename = "prev_total", default, deserialize_with = "optional_count")]
    pub last_total: Option<u64>,
}

impl QuotaEntry {
    /// Fresh entry with zero usage
    pub fn new(limit: Option<u64>, baseline: Option<u64>) -> Self {
        Self {
            limit,
            used: 0,
            last_total: baseline,
        }
    }

    /// Whether usage has reached a finite limit
    pub fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.used >= limit)
    }

    /// Fold in a newly observed cumulative total and return the usage added
    pub fn observe(&mut self, total: u64) -> u64 {
        let delta = match self.last_total {
            Some(previous) => total.saturating_sub(previous),
            None => 0,
        };
        self.used = self.used.saturating_add(delta);
        self.last_total = Some(total);
        delta
    }
}

/// Quota entries persisted as a JSON object keyed by peer name
pub struct QuotaLedger {
    path: PathBuf,
    entries: BTreeMap<String, QuotaEntry>,
}

impl QuotaLedger {
    /// Load the ledger; a missing or malformed file yields an empty ledger
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("{}; starting with an empty quota ledger", e);
                BTreeMap::new()
            }
        };
        log::debug!("Loaded {} quota entries from {:?}", entries.len(), path);
        Self { path, entries }
    }

    /// Persist the ledger
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries).map_err(|e| Error::StoreCorrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &json)
    }

    pub fn get(&self, name: &str) -> Option<&QuotaEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &QuotaEntry)> {
        self.entries.iter()
    }

    /// Whether the peer has an entry at or over its limit
    pub fn is_exhausted(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(QuotaEntry::is_exhausted)
    }

    /// Overwrite the peer's entry with zero usage, `limit` and `baseline`
    pub fn assign(&mut self, name: &str, limit: Option<u64>, baseline: Option<u64>) {
        self.entries
            .insert(name.to_string(), QuotaEntry::new(limit, baseline));
    }

    /// Zero the peer's usage keeping its limit; returns false if it has no entry
    pub fn reset_usage(&mut self, name: &str, baseline: Option<u64>) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.used = 0;
                entry.last_total = baseline;
                true
            }
            None => false,
        }
    }

    /// Drop the peer's entry
    pub fn remove(&mut self, name: &str) -> Option<QuotaEntry> {
        self.entries.remove(name)
    }

    /// Fold one tick of cumulative totals into usage
    ///
    /// Returns the peers whose usage is at or over their limit after the
    /// update. Peers without an entry, and entries absent from `totals`, are
    /// left untouched.
    pub fn reconcile(&mut self, totals: &TransferTotals) -> Vec<String> {
        let mut exhausted = Vec::new();

        for (name, entry) in self.entries.iter_mut() {
            let Some(transfer) = totals.get(name) else {
                continue;
            };

            let delta = entry.observe(transfer.total());
            if delta > 0 {
                log::debug!("Peer {} used {} more bytes ({} total)", name, delta, entry.used);
            }

            if entry.is_exhausted() {
                exhausted.push(name.clone());
            }
        }

        exhausted
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, QuotaEntry>> {
    let corrupt = |reason: String| Error::StoreCorrupt {
        path: path.display().to_string(),
        reason,
    };

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(corrupt(e.to_string())),
    };

    serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))
}
