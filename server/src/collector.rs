//! Periodic collection ticker.
//!
//! A dedicated thread registered with the reclamation domain runs
//! `cache.collect()` on a fixed period, checkpointing around each pass.
//! Collection both expires dead entries and resizes the table, so the
//! ticker runs for the life of the server.

use ember_cache::Cache;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Seconds between collection passes.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

/// Handle to the collector thread; stops and joins on drop.
pub struct Collector {
    stopping: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Spawn the collection ticker.
pub fn spawn(cache: Arc<Cache>, period: Duration) -> Collector {
    let stopping = Arc::new(AtomicBool::new(false));
    let handle = {
        let stopping = stopping.clone();
        std::thread::Builder::new()
            .name("ember-collector".into())
            .spawn(move || run(cache, period, stopping))
            .expect("failed to spawn collector thread")
    };
    Collector {
        stopping,
        handle: Some(handle),
    }
}

fn run(cache: Arc<Cache>, period: Duration, stopping: Arc<AtomicBool>) {
    cache.domain().register();
    cache.domain().checkpoint();
    info!(period_secs = period.as_secs(), "collector running");

    while !stopping.load(Ordering::Relaxed) {
        let begun = Instant::now();
        cache.collect();
        cache.domain().checkpoint();
        debug!(
            elapsed_us = begun.elapsed().as_micros() as u64,
            buckets = cache.buckets(),
            keys = cache.keys(),
            bytes = cache.bytes(),
            "collection pass"
        );

        // sleep in short slices so stop() is prompt
        let mut remaining = period;
        while !stopping.load(Ordering::Relaxed) && remaining > Duration::ZERO {
            let slice = remaining.min(Duration::from_millis(100));
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }

    cache.domain().exit();
}

impl Collector {
    /// Stop the ticker and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}
