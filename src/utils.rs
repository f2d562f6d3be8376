use std::thread;

pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Worker loops to start when none are configured: one per available core.
pub fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_WORKER_THREADS)
}
