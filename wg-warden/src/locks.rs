//! Per-peer mutual exclusion
//!
//! Quota blocks, expiry fires and operator calls for the same peer serialize
//! on that peer's lock for the whole check-mutate-resync sequence. Waiting is
//! bounded and surfaces as [`Error::LockTimeout`].

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard held while operating on one peer
pub type PeerGuard = OwnedMutexGuard<()>;

/// Lazily created async mutex per peer name
pub struct PeerLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl PeerLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn slot(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(name.to_string()).or_default().clone()
    }

    /// Lock the peer, failing with `LockTimeout` after the configured bound
    pub async fn acquire(&self, name: &str) -> Result<PeerGuard> {
        let slot = self.slot(name);
        tokio::time::timeout(self.timeout, slot.lock_owned())
            .await
            .map_err(|_| {
                log::warn!("Timed out waiting for lock on peer {}", name);
                Error::LockTimeout {
                    peer: name.to_string(),
                    waited: self.timeout,
                }
            })
    }

    /// Forget a deleted peer's slot; current holders keep their guard
    pub fn forget(&self, name: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_contention_times_out() {
        let locks = PeerLocks::new(Duration::from_secs(30));
        let _held = locks.acquire("alice").await.unwrap();

        let err = locks.acquire("alice").await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { ref peer, .. } if peer == "alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peers_are_independent() {
        let locks = PeerLocks::new(Duration::from_secs(1));
        let _alice = locks.acquire("alice").await.unwrap();
        assert!(locks.acquire("bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_released_lock_reacquired() {
        let locks = PeerLocks::new(Duration::from_secs(1));
        drop(locks.acquire("alice").await.unwrap());
        assert!(locks.acquire("alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_forget_allows_fresh_slot() {
        let locks = PeerLocks::new(Duration::from_secs(1));
        let held = locks.acquire("alice").await.unwrap();
        locks.forget("alice");
        assert!(locks.acquire("alice").await.is_ok());
        drop(held);
    }
}
