//! One-shot expiry timers, one per peer
//!
//! Each armed timer carries a generation number. Arming or cancelling bumps
//! the slot, and a fired callback must confirm with [`ExpiryTimers::is_current`]
//! (while holding the peer lock) before acting. Callers arm and cancel while
//! holding the same peer lock, so a cancelled timer's callback never acts:
//! either it is aborted while sleeping or waiting for the lock, or it wakes
//! holding the lock and finds its generation replaced.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Registry of armed expiry timers
pub struct ExpiryTimers {
    slots: Mutex<HashMap<String, TimerSlot>>,
    next_generation: AtomicU64,
}

impl Default for ExpiryTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryTimers {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm (or re-arm) the peer's timer; `fire` receives the timer's generation
    pub fn arm<F, Fut>(&self, name: &str, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Deadline counts from arming, not from the task's first poll
        let deadline = Instant::now() + delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(generation).await;
        });

        let previous = self
            .slots()
            .insert(name.to_string(), TimerSlot { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        log::debug!("Armed expiry timer for {} in {:?}", name, delay);
        generation
    }

    /// Cancel the peer's timer; returns whether one was armed
    pub fn cancel(&self, name: &str) -> bool {
        match self.slots().remove(name) {
            Some(slot) => {
                slot.handle.abort();
                log::debug!("Cancelled expiry timer for {}", name);
                true
            }
            None => false,
        }
    }

    /// Whether `generation` is still the peer's armed timer
    pub fn is_current(&self, name: &str, generation: u64) -> bool {
        self.slots()
            .get(name)
            .is_some_and(|slot| slot.generation == generation)
    }

    /// Drop a fired timer's slot without aborting the running callback
    pub fn finish(&self, name: &str, generation: u64) {
        let mut slots = self.slots();
        if slots.get(name).is_some_and(|slot| slot.generation == generation) {
            slots.remove(name);
        }
    }

    /// Whether the peer has an armed timer
    pub fn is_armed(&self, name: &str) -> bool {
        self.slots().contains_key(name)
    }

    /// Cancel every timer (shutdown)
    pub fn cancel_all(&self) {
        for (_, slot) in self.slots().drain() {
            slot.handle.abort();
        }
    }
}
