//! Expiry ledger
//!
//! Durable mapping of peer name to an absolute expiry instant, or `null` for
//! unlimited. Timestamps are ISO-8601; ones without an offset are read as UTC.

use crate::error::{Error, Result};
use crate::state_file::write_atomic;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Expiry entries persisted as a JSON object keyed by peer name
pub struct ExpiryLedger {
    path: PathBuf,
    entries: BTreeMap<String, Option<DateTime<Utc>>>,
}

impl ExpiryLedger {
    /// Load the ledger; a missing or malformed file yields an empty ledger
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("{}; starting with an empty expiry ledger", e);
                BTreeMap::new()
            }
        };
        log::debug!("Loaded {} expiry entries from {:?}", entries.len(), path);
        Self { path, entries }
    }

    /// Persist the ledger
    pub fn save(&self) -> Result<()> {
        let raw: BTreeMap<&String, Option<String>> = self
            .entries
            .iter()
            .map(|(name, at)| (name, at.map(|at| at.to_rfc3339())))
            .collect();
        let json = serde_json::to_string_pretty(&raw).map_err(|e| Error::StoreCorrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &json)
    }

    /// `None` if the peer has no entry, `Some(None)` if it is unlimited
    pub fn get(&self, name: &str) -> Option<Option<DateTime<Utc>>> {
        self.entries.get(name).copied()
    }

    pub fn set(&mut self, name: &str, expires_at: Option<DateTime<Utc>>) {
        self.entries.insert(name.to_string(), expires_at);
    }

    pub fn remove(&mut self, name: &str) -> Option<Option<DateTime<Utc>>> {
        self.entries.remove(name)
    }

    /// Peers with a finite expiry
    pub fn finite(&self) -> Vec<(String, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter_map(|(name, at)| at.map(|at| (name.clone(), at)))
            .collect()
    }

    /// Whether the peer's expiry has passed at `now`
    pub fn is_elapsed(&self, name: &str, now: DateTime<Utc>) -> bool {
        matches!(self.entries.get(name), Some(Some(at)) if *at <= now)
    }
}

/// Parse an ISO-8601 timestamp, treating offset-less values as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, Option<DateTime<Utc>>>> {
    let corrupt = |reason: String| Error::StoreCorrupt {
        path: path.display().to_string(),
        reason,
    };

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(corrupt(e.to_string())),
    };

    let raw: BTreeMap<String, Option<String>> =
        serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;

    let mut entries = BTreeMap::new();
    for (name, value) in raw {
        match value.as_deref().filter(|v| !v.is_empty()) {
            None => {
                entries.insert(name, None);
            }
            Some(value) => match parse_timestamp(value) {
                Some(at) => {
                    entries.insert(name, Some(at));
                }
                None => log::warn!("Skipping unparseable expiry '{}' for peer {}", value, name),
            },
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ledger() -> (tempfile::TempDir, ExpiryLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ExpiryLedger::load(dir.path().join("expirations.json"));
        (dir, ledger)
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2026-03-01T12:00:00+00:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01T15:00:00+03:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01T12:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-03-01 12:00:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_save_and_reload() {
        let (dir, mut ledger) = ledger();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        ledger.set("alice", Some(at));
        ledger.set("bob", None);
        ledger.save().unwrap();

        let reloaded = ExpiryLedger::load(dir.path().join("expirations.json"));
        assert_eq!(reloaded.get("alice"), Some(Some(at)));
        assert_eq!(reloaded.get("bob"), Some(None));
        assert_eq!(reloaded.get("carol"), None);
    }

    #[test]
    fn test_file_format_compatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expirations.json");
        fs::write(
            &path,
            r#"{"alice": "2026-03-01T12:00:00.123456+00:00", "bob": null, "carol": "garbage", "dave": ""}"#,
        )
        .unwrap();

        let ledger = ExpiryLedger::load(&path);
        assert!(ledger.get("alice").unwrap().is_some());
        assert_eq!(ledger.get("bob"), Some(None));
        assert_eq!(ledger.get("carol"), None);
        assert_eq!(ledger.get("dave"), Some(None));
    }

    #[test]
    fn test_missing_and_malformed_files_are_empty() {
        let (_dir, ledger) = ledger();
        assert!(ledger.finite().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expirations.json");
        fs::write(&path, "[1, 2").unwrap();
        let ledger = ExpiryLedger::load(&path);
        assert!(ledger.finite().is_empty());
        assert!(matches!(read_entries(&path), Err(Error::StoreCorrupt { .. })));
    }

    #[test]
    fn test_finite_and_elapsed() {
        let (_dir, mut ledger) = ledger();
        let now = Utc::now();
        ledger.set("past", Some(now - Duration::hours(1)));
        ledger.set("future", Some(now + Duration::hours(1)));
        ledger.set("forever", None);

        let finite: Vec<String> = ledger.finite().into_iter().map(|(n, _)| n).collect();
        assert_eq!(finite, ["future", "past"]);

        assert!(ledger.is_elapsed("past", now));
        assert!(!ledger.is_elapsed("future", now));
        assert!(!ledger.is_elapsed("forever", now));
        assert!(!ledger.is_elapsed("nobody", now));
    }

    #[test]
    fn test_remove() {
        let (_dir, mut ledger) = ledger();
        ledger.set("alice", None);
        assert_eq!(ledger.remove("alice"), Some(None));
        assert_eq!(ledger.remove("alice"), None);
    }
}
