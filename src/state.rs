//! Shared lifecycle cells.
//!
//! Each cell is an independent owner of one piece of mutable proxy state.
//! Components receive an `Arc` of the cells they need at construction time.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Last time anything counted as user or pipeline activity.
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.set(Instant::now());
    }

    pub fn set(&self, at: Instant) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn get(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.get().elapsed()
    }
}

/// Last observed number of live terminal sessions.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    count: AtomicU64,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Store a new count. Returns `true` if it differs from the previous one.
    pub fn set(&self, count: u64) -> bool {
        self.count.swap(count, Ordering::AcqRel) != count
    }
}

/// Set once the instance has decided to stop serving lifecycle work.
///
/// Monitors check this before acting so that only one of them emits a
/// notification for a given teardown.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    set: AtomicBool,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
    }

    /// Only the spot monitor clears the flag, after its cooldown, and only
    /// when it was the one that set it.
    pub fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }

    /// Set the flag if it was clear. Returns `true` if this call set it.
    pub fn try_set(&self) -> bool {
        self.set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The cells shared between the HTTP layer and the monitors.
#[derive(Debug, Default)]
pub struct SharedState {
    pub activity: ActivityClock,
    pub connections: ConnectionCounter,
    pub shutdown: ShutdownFlag,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }
}
