//! Coarse second-resolution timestamps.
//!
//! Entries stamp access and modification times on hot paths, so the
//! clock read must be cheap; the coarse clocksource reads a cached
//! kernel timestamp instead of issuing a syscall.

use crate::sync::{AtomicU32, Ordering};
use clocksource::coarse::UnixInstant;

/// Current unix time in whole seconds.
#[inline]
pub fn unix_now() -> u32 {
    UnixInstant::now()
        .duration_since(UnixInstant::EPOCH)
        .as_secs() as u32
}

/// An atomically updated unix-second timestamp.
pub struct Timestamp(AtomicU32);

impl Timestamp {
    /// A timestamp initialized to the current time.
    pub fn now() -> Self {
        Timestamp(AtomicU32::new(unix_now()))
    }

    /// Restamp with the current time.
    pub fn update(&self) {
        self.0.store(unix_now(), Ordering::Relaxed);
    }

    /// The stored time in unix seconds.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}
