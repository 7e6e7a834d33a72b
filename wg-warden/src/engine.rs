// Lifecycle engine for peer access

//! Peer lifecycle engine
//!
//! This module implements the control loop that gates peers by time and
//! traffic. A peer is `Active`, or blocked for one of three reasons: its
//! expiry elapsed, its quota was exhausted, or an operator disabled it. The
//! config file only records *whether* a peer is blocked; the ledgers record
//! *why*.
//!
//! Transitions:
//! - reconciliation ticks fold daemon counters into the quota ledger and
//!   block peers at or over their limit;
//! - one-shot timers block peers whose expiry elapsed;
//! - operator calls enable, disable, re-limit, re-expire and delete peers.
//!
//! Every transition for a peer runs under that peer's lock, including the
//! daemon resync. Ledgers are only updated after the config mutation they
//! describe has succeeded.

use crate::counters::{fetch_peer_stats, fetch_transfer_totals, try_fetch_transfer_totals};
use crate::daemon::Daemon;
use crate::error::{validate_name, Error, Result};
use crate::expiry::ExpiryLedger;
use crate::locks::PeerLocks;
use crate::peer_config::{peers, PeerConfigStore, PeerEntry};
use crate::quota::{QuotaEntry, QuotaLedger};
use crate::timers::ExpiryTimers;
use crate::types::{Lifetime, PeerState, Quota};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Events worth telling an operator about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Peer reached its byte limit and was blocked
    QuotaExceeded { peer: String, used: u64, limit: u64 },
    /// Peer's time limit elapsed and it was blocked
    Expired { peer: String },
    /// A limit was reached but blocking the peer failed
    BlockFailed { peer: String, reason: String },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::QuotaExceeded { peer, used, limit } => write!(
                f,
                "Peer {} reached its traffic limit ({} of {} bytes) and was blocked",
                peer, used, limit
            ),
            Notification::Expired { peer } => {
                write!(f, "Peer {} expired and was blocked", peer)
            }
            Notification::BlockFailed { peer, reason } => {
                write!(f, "Failed to block peer {}: {}", peer, reason)
            }
        }
    }
}

/// Live daemon statistics for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStats {
    pub endpoint: Option<String>,
    pub latest_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Observable state of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: String,
    pub state: PeerState,
    pub allowed_ips: Option<String>,
    pub quota: Option<QuotaEntry>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStats>,
}

/// Resets the in-progress flag when a tick finishes, however it finishes
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner<D: Daemon> {
    store: PeerConfigStore<D>,
    quotas: Mutex<QuotaLedger>,
    expiries: Mutex<ExpiryLedger>,
    locks: PeerLocks,
    timers: ExpiryTimers,
    tick_running: AtomicBool,
    notifications: mpsc::Sender<Notification>,
}

/// The lifecycle engine; cheap to clone, all clones share state
pub struct Warden<D: Daemon> {
    inner: Arc<Inner<D>>,
}

impl<D: Daemon> Clone for Warden<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Daemon> Warden<D> {
    /// Create an engine over a config store and the two ledgers
    pub fn new(
        store: PeerConfigStore<D>,
        quotas: QuotaLedger,
        expiries: ExpiryLedger,
        lock_timeout: Duration,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                quotas: Mutex::new(quotas),
                expiries: Mutex::new(expiries),
                locks: PeerLocks::new(lock_timeout),
                timers: ExpiryTimers::new(),
                tick_running: AtomicBool::new(false),
                notifications,
            }),
        }
    }

    fn daemon(&self) -> &D {
        self.inner.store.daemon()
    }

    fn quotas(&self) -> MutexGuard<'_, QuotaLedger> {
        self.inner.quotas.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expiries(&self) -> MutexGuard<'_, ExpiryLedger> {
        self.inner.expiries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save_quotas(&self, quotas: &QuotaLedger) {
        if let Err(e) = quotas.save() {
            log::error!("Failed to save quota ledger: {}", e);
        }
    }

    fn save_expiries(&self, expiries: &ExpiryLedger) {
        if let Err(e) = expiries.save() {
            log::error!("Failed to save expiry ledger: {}", e);
        }
    }

    async fn notify(&self, notification: Option<Notification>) {
        let Some(notification) = notification else {
            return;
        };
        if self.inner.notifications.send(notification).await.is_err() {
            log::debug!("Notification receiver closed");
        }
    }

    /// Rebuild expiry timers after a start; elapsed expiries are applied now
    pub async fn recover(&self) {
        let now = Utc::now();
        let finite = self.expiries().finite();

        for (name, at) in finite {
            let guard = match self.inner.locks.acquire(&name).await {
                Ok(guard) => guard,
                Err(e) => {
                    log::error!("Could not restore expiry for {}: {}", name, e);
                    continue;
                }
            };

            if at > now {
                self.arm_expiry(&name, at);
                continue;
            }

            let notification = match self.inner.store.is_blocked(&name) {
                Ok(true) => None,
                Ok(false) => {
                    log::info!("Expiry of {} passed at {} while stopped, blocking now", name, at);
                    self.expire_locked(&name).await
                }
                Err(e) => {
                    log::warn!("Skipping expiry catch-up for {}: {}", name, e);
                    None
                }
            };

            drop(guard);
            self.notify(notification).await;
        }
    }

    /// Arm the peer's expiry timer; the caller holds the peer lock
    fn arm_expiry(&self, name: &str, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let warden = self.clone();
        let peer = name.to_string();

        self.inner.timers.arm(name, delay, move |generation| async move {
            warden.on_expiry_timer(peer, generation).await;
        });
        log::info!("Peer {} expires at {}", name, at);
    }

    async fn on_expiry_timer(&self, name: String, generation: u64) {
        // Keep retrying while this timer is still the armed one; cancellation aborts us
        let guard = loop {
            match self.inner.locks.acquire(&name).await {
                Ok(guard) => break guard,
                Err(e) => {
                    if !self.inner.timers.is_current(&name, generation) {
                        return;
                    }
                    log::warn!("Expiry of {} delayed: {}", name, e);
                }
            }
        };

        if !self.inner.timers.is_current(&name, generation) {
            log::debug!("Ignoring superseded expiry timer for {}", name);
            return;
        }
        self.inner.timers.finish(&name, generation);

        let notification = self.expire_locked(&name).await;
        drop(guard);
        self.notify(notification).await;
    }

    /// Active -> ExpiredBlocked; the caller holds the peer lock
    async fn expire_locked(&self, name: &str) -> Option<Notification> {
        match self.inner.store.is_blocked(name) {
            Ok(true) => {
                log::info!("Peer {} expired while already blocked", name);
                self.stamp_expired(name);
                None
            }
            Ok(false) => match self.inner.store.block(name).await {
                Ok(()) => {
                    self.stamp_expired(name);
                    log::info!("Peer {} expired and was blocked", name);
                    Some(Notification::Expired {
                        peer: name.to_string(),
                    })
                }
                Err(e) => {
                    log::error!("Failed to block expired peer {}: {}", name, e);
                    Some(Notification::BlockFailed {
                        peer: name.to_string(),
                        reason: e.to_string(),
                    })
                }
            },
            Err(e) => {
                log::warn!("Expiry of {} not applied: {}", name, e);
                None
            }
        }
    }

    fn stamp_expired(&self, name: &str) {
        let mut expiries = self.expiries();
        expiries.set(name, Some(Utc::now()));
        self.save_expiries(&expiries);
    }

    /// Run one reconciliation pass unless one is still in progress
    ///
    /// Returns false when the tick was skipped.
    pub async fn tick(&self) -> bool {
        if self
            .inner
            .tick_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Previous reconciliation still running, skipping tick");
            return false;
        }
        let _running = TickGuard(&self.inner.tick_running);

        self.reconcile_once().await;
        true
    }

    async fn reconcile_once(&self) {
        let text = match self.inner.store.read() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to read {:?}: {}", self.inner.store.path(), e);
                return;
            }
        };

        self.retry_elapsed_expiries(&text).await;

        let totals = fetch_transfer_totals(self.daemon(), &text).await;
        if totals.is_empty() {
            return;
        }

        let exhausted = {
            let mut quotas = self.quotas();
            let exhausted = quotas.reconcile(&totals);
            self.save_quotas(&quotas);
            exhausted
        };

        for name in exhausted {
            self.enforce_quota(&name).await;
        }
    }

    /// Block active peers whose expiry elapsed without a timer left to do it
    ///
    /// This is the case after a block failed at fire time.
    async fn retry_elapsed_expiries(&self, text: &str) {
        let now = Utc::now();
        let pending: Vec<String> = {
            let expiries = self.expiries();
            peers(text)
                .into_iter()
                .filter(|entry| !entry.blocked && expiries.is_elapsed(&entry.name, now))
                .map(|entry| entry.name)
                .collect()
        };

        for name in pending {
            let guard = match self.inner.locks.acquire(&name).await {
                Ok(guard) => guard,
                Err(e) => {
                    log::warn!("Expiry retry for {} deferred to next tick: {}", name, e);
                    continue;
                }
            };

            // A timer still waiting on the lock applies it itself
            let elapsed = self.expiries().is_elapsed(&name, Utc::now());
            let notification = if self.inner.timers.is_armed(&name) || !elapsed {
                None
            } else {
                match self.inner.store.is_blocked(&name) {
                    Ok(false) => {
                        log::info!("Retrying block of expired peer {}", name);
                        self.expire_locked(&name).await
                    }
                    Ok(true) => None,
                    Err(e) => {
                        log::warn!("Expiry retry for {} skipped: {}", name, e);
                        None
                    }
                }
            };

            drop(guard);
            self.notify(notification).await;
        }
    }

    /// Active -> QuotaBlocked
    async fn enforce_quota(&self, name: &str) {
        let guard = match self.inner.locks.acquire(name).await {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Quota enforcement for {} deferred to next tick: {}", name, e);
                return;
            }
        };

        // Re-check under the lock: an operator may have reset the quota meanwhile
        let exhausted = self
            .quotas()
            .get(name)
            .filter(|entry| entry.is_exhausted())
            .map(|entry| (entry.used, entry.limit.unwrap_or_default()));
        let Some((used, limit)) = exhausted else {
            return;
        };

        let notification = match self.inner.store.is_blocked(name) {
            Ok(true) => None,
            Ok(false) => match self.inner.store.block(name).await {
                Ok(()) => {
                    log::info!("Peer {} reached {} of {} bytes and was blocked", name, used, limit);
                    Some(Notification::QuotaExceeded {
                        peer: name.to_string(),
                        used,
                        limit,
                    })
                }
                Err(e) => {
                    log::error!("Failed to block peer {} over quota: {}", name, e);
                    Some(Notification::BlockFailed {
                        peer: name.to_string(),
                        reason: e.to_string(),
                    })
                }
            },
            Err(e) => {
                log::warn!("Quota enforcement for {} skipped: {}", name, e);
                None
            }
        };

        drop(guard);
        self.notify(notification).await;
    }

    /// Current cumulative total for a peer, `None` if the daemon could not be queried
    async fn current_total(&self, name: &str) -> Option<u64> {
        let text = self.inner.store.read().ok()?;
        match try_fetch_transfer_totals(self.daemon(), &text).await {
            Ok(totals) => Some(totals.get(name).map(|t| t.total()).unwrap_or(0)),
            Err(e) => {
                log::warn!("No counter baseline for {}: {}", name, e);
                None
            }
        }
    }

    /// Set the peer's expiry, re-arming its timer; the caller holds the peer lock
    async fn apply_lifetime_locked(&self, name: &str, lifetime: Lifetime) -> Option<Notification> {
        self.inner.timers.cancel(name);
        {
            let mut expiries = self.expiries();
            expiries.set(name, lifetime.expires_at());
            self.save_expiries(&expiries);
        }

        match lifetime {
            Lifetime::Unlimited => {
                log::info!("Peer {} has no time limit", name);
                None
            }
            Lifetime::Until(at) if at > Utc::now() => {
                self.arm_expiry(name, at);
                None
            }
            Lifetime::Until(_) => self.expire_locked(name).await,
        }
    }

    /// Re-enable a blocked peer, optionally with a new expiry and/or quota
    ///
    /// An exhausted quota is reset to zero usage even without a new limit, and
    /// an elapsed expiry without a replacement becomes unlimited.
    pub async fn enable(
        &self,
        name: &str,
        expiry: Option<Lifetime>,
        quota: Option<Quota>,
    ) -> Result<PeerStatus> {
        validate_name(name)?;
        let baseline = self.current_total(name).await;
        let guard = self.inner.locks.acquire(name).await?;

        if self.inner.store.is_blocked(name)? {
            self.inner.store.unblock(name).await?;
        }

        {
            let mut quotas = self.quotas();
            match quota {
                Some(quota) => quotas.assign(name, quota.limit(), baseline),
                None if quotas.is_exhausted(name) => {
                    quotas.reset_usage(name, baseline);
                }
                None => {}
            }
            self.save_quotas(&quotas);
        }

        let expiry = expiry.or_else(|| {
            self.expiries()
                .is_elapsed(name, Utc::now())
                .then_some(Lifetime::Unlimited)
        });
        let notification = match expiry {
            Some(lifetime) => self.apply_lifetime_locked(name, lifetime).await,
            None => None,
        };

        drop(guard);
        log::info!("Enabled peer {}", name);
        self.notify(notification).await;
        self.status(name).await
    }

    /// Block a peer without touching its limits
    pub async fn disable(&self, name: &str) -> Result<PeerStatus> {
        validate_name(name)?;
        let guard = self.inner.locks.acquire(name).await?;

        if !self.inner.store.is_blocked(name)? {
            self.inner.store.block(name).await?;
        }

        drop(guard);
        log::info!("Disabled peer {}", name);
        self.status(name).await
    }

    /// Assign a new byte limit, zero the usage and unblock the peer
    ///
    /// An elapsed expiry is cleared to unlimited, otherwise the next restart
    /// would block the peer again.
    pub async fn set_quota(&self, name: &str, quota: Quota) -> Result<PeerStatus> {
        validate_name(name)?;
        let baseline = self.current_total(name).await;
        let guard = self.inner.locks.acquire(name).await?;

        if self.inner.store.is_blocked(name)? {
            self.inner.store.unblock(name).await?;
        }

        {
            let mut quotas = self.quotas();
            quotas.assign(name, quota.limit(), baseline);
            self.save_quotas(&quotas);
        }

        let expired = self.expiries().is_elapsed(name, Utc::now());
        if expired {
            self.apply_lifetime_locked(name, Lifetime::Unlimited).await;
        }

        drop(guard);
        log::info!("Peer {} traffic limit set to {:?}", name, quota.limit());
        self.status(name).await
    }

    /// Replace the peer's expiry; an instant already in the past blocks it now
    pub async fn set_expiry(&self, name: &str, lifetime: Lifetime) -> Result<PeerStatus> {
        validate_name(name)?;
        let guard = self.inner.locks.acquire(name).await?;

        // Surface NotFound before touching the ledger
        self.inner.store.is_blocked(name)?;
        let notification = self.apply_lifetime_locked(name, lifetime).await;

        drop(guard);
        self.notify(notification).await;
        self.status(name).await
    }

    /// Remove the peer from the config and forget it; absent peers are a no-op
    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let guard = self.inner.locks.acquire(name).await?;

        self.inner.timers.cancel(name);
        self.inner.store.remove(name).await?;

        {
            let mut quotas = self.quotas();
            if quotas.remove(name).is_some() {
                self.save_quotas(&quotas);
            }
        }
        {
            let mut expiries = self.expiries();
            if expiries.remove(name).is_some() {
                self.save_expiries(&expiries);
            }
        }

        drop(guard);
        self.inner.locks.forget(name);
        log::info!("Deleted peer {}", name);
        Ok(())
    }

    fn summarize(&self, entry: PeerEntry, now: DateTime<Utc>) -> PeerStatus {
        let quotas = self.quotas();
        let expiries = self.expiries();

        let state = if !entry.blocked {
            PeerState::Active
        } else if expiries.is_elapsed(&entry.name, now) {
            PeerState::ExpiredBlocked
        } else if quotas.is_exhausted(&entry.name) {
            PeerState::QuotaBlocked
        } else {
            PeerState::Disabled
        };

        PeerStatus {
            state,
            allowed_ips: entry.allowed_ips,
            quota: quotas.get(&entry.name).cloned(),
            expires_at: expiries.get(&entry.name).flatten(),
            live: None,
            name: entry.name,
        }
    }

    /// Every peer in the config with its observable state
    pub fn list_peers(&self) -> Result<Vec<PeerStatus>> {
        let now = Utc::now();
        Ok(self
            .inner
            .store
            .peers()?
            .into_iter()
            .map(|entry| self.summarize(entry, now))
            .collect())
    }

    /// One peer's observable state plus live daemon statistics
    pub async fn status(&self, name: &str) -> Result<PeerStatus> {
        let text = self.inner.store.read()?;
        let entry = peers(&text)
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let mut status = self.summarize(entry, Utc::now());
        status.live = fetch_peer_stats(self.daemon(), &text, name)
            .await
            .map(|stats| LiveStats {
                endpoint: stats.endpoint,
                latest_handshake: stats.latest_handshake,
                rx_bytes: stats.rx_bytes,
                tx_bytes: stats.tx_bytes,
            });
        Ok(status)
    }

    /// Cancel every pending expiry timer
    pub fn shutdown(&self) {
        self.inner.timers.cancel_all();
    }
}
