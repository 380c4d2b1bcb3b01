//! Synchronization primitives with optional loom support.
//!
//! Everything in the crate that touches an atomic imports it from here,
//! so the whole engine can be model-checked with loom while production
//! builds use std atomics directly.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{
    AtomicIsize, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{
    AtomicIsize, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// Spin loop hint for bounded retry loops.
///
/// Under loom this yields instead, so the model checker can interleave
/// the competing thread.
#[inline]
pub fn spin_loop() {
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();

    #[cfg(feature = "loom")]
    loom::thread::yield_now();
}
