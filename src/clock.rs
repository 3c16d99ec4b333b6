//! Monotonic time source for the daemon, injectable for tests (C1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic time plus wall-clock epoch seconds for persistence.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds since an arbitrary but fixed monotonic origin.
    fn monotonic_secs(&self) -> f64;

    /// Unix epoch seconds, for timestamps written to disk.
    fn unix_secs(&self) -> u64;
}

/// Real wall-clock backed implementation used in production.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn unix_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock that only advances when told to, for deterministic property tests.
#[derive(Debug, Clone)]
pub struct FrozenClock {
    monotonic: Arc<AtomicU64>, // stored as millis
    unix: Arc<AtomicU64>,
}

impl FrozenClock {
    pub fn new(start_unix_secs: u64) -> Self {
        Self {
            monotonic: Arc::new(AtomicU64::new(0)),
            unix: Arc::new(AtomicU64::new(start_unix_secs)),
        }
    }

    /// Advance both the monotonic and wall clocks by the same duration.
    pub fn advance(&self, secs: f64) {
        let millis = (secs * 1000.0).round() as u64;
        self.monotonic.fetch_add(millis, Ordering::SeqCst);
        self.unix.fetch_add(millis / 1000, Ordering::SeqCst);
    }
}

impl Clock for FrozenClock {
    fn monotonic_secs(&self) -> f64 {
        self.monotonic.load(Ordering::SeqCst) as f64 / 1000.0
    }

    fn unix_secs(&self) -> u64 {
        self.unix.load(Ordering::SeqCst)
    }
}
