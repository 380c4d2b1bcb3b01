//! Worker thread management utilities.

use std::thread::{self, JoinHandle};

/// Handle to a spawned worker thread.
pub struct WorkerHandle<R> {
    /// The thread handle
    pub handle: JoinHandle<R>,
    /// The worker index (0-based)
    pub worker_id: usize,
}

/// Spawn `num_workers` named worker threads.
pub fn spawn_workers<F, R>(num_workers: usize, name_prefix: &str, worker_fn: F) -> Vec<WorkerHandle<R>>
where
    F: Fn(usize) -> R + Send + Clone + 'static,
    R: Send + 'static,
{
    let mut handles = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let worker_fn = worker_fn.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", name_prefix, worker_id))
            .spawn(move || worker_fn(worker_id))
            .expect("failed to spawn worker thread");
        handles.push(WorkerHandle { handle, worker_id });
    }
    handles
}

/// Wait for all worker threads to complete.
pub fn join_workers<R>(handles: Vec<WorkerHandle<R>>) -> Vec<R> {
    handles
        .into_iter()
        .map(|h| h.handle.join().expect("worker thread panicked"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_and_joins() {
        let handles = spawn_workers(3, "test-worker", |id| id * 2);
        let mut results = join_workers(handles);
        results.sort_unstable();
        assert_eq!(results, vec![0, 2, 4]);
    }

    #[test]
    fn threads_are_named() {
        let handles = spawn_workers(1, "named", |_| {
            thread::current().name().map(str::to_owned)
        });
        let results = join_workers(handles);
        assert_eq!(results[0].as_deref(), Some("named-0"));
    }
}
