//! Worker dispatch.

use std::{
    io,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use snafu::ResultExt as _;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::error::{Error, WorkerPool as WorkerPoolSnafu};

const DEFAULT_THREAD_NAME: &str = "geobind-worker";

/// Configuration for a worker pool.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfiguration {
    worker_threads: usize,
    thread_name: String,
}

impl WorkerPoolConfiguration {
    /// Creates a new `WorkerPoolConfiguration` with the given number of worker threads.
    ///
    /// At least one worker thread is always used.
    pub fn new(worker_threads: usize) -> Self {
        Self {
            worker_threads: worker_threads.max(1),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// Sets the prefix of worker thread names.
    ///
    /// Worker threads are named `<prefix>-NN`.
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Returns the number of worker threads.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Returns the prefix of worker thread names.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    fn build(&self) -> io::Result<Runtime> {
        let thread_name = self.thread_name.clone();
        let thread_id = Arc::new(AtomicUsize::new(0));

        // Native steps block, so they run on the blocking pool, which is sized to the worker count. The single
        // runtime worker thread only drives task bookkeeping.
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.worker_threads)
            .thread_name_fn(move || {
                let new_thread_id = thread_id.fetch_add(1, Ordering::SeqCst);
                format!("{}-{:02}", thread_name, new_thread_id)
            })
            .build()
    }
}

impl Default for WorkerPoolConfiguration {
    fn default() -> Self {
        Self::new(thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1))
    }
}

/// A pool of threads running native steps.
///
/// Dropping the pool waits for every native step already submitted to run to completion.
pub struct WorkerPool {
    runtime: Runtime,
    worker_threads: usize,
}

impl WorkerPool {
    /// Creates a new `WorkerPool` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the underlying threads cannot be set up, an error is returned.
    pub fn new(config: &WorkerPoolConfiguration) -> Result<Self, Error> {
        let runtime = config.build().context(WorkerPoolSnafu)?;

        debug!(
            worker_threads = config.worker_threads,
            thread_name = %config.thread_name,
            "Created worker pool."
        );

        Ok(Self {
            runtime,
            worker_threads: config.worker_threads,
        })
    }

    /// Returns the maximum number of native steps running at the same time.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Runs the given function on a worker thread.
    pub(crate) fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Completion is reported through the function itself, so the join handle is not needed.
        let _ = self.runtime.spawn_blocking(f);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Barrier},
        time::Duration,
    };

    use super::*;

    #[test]
    fn worker_count_is_at_least_one() {
        assert_eq!(WorkerPoolConfiguration::new(0).worker_threads(), 1);
        assert!(WorkerPoolConfiguration::default().worker_threads() >= 1);
    }

    #[test]
    fn runs_on_named_worker_threads() {
        let pool = WorkerPool::new(&WorkerPoolConfiguration::new(1).with_thread_name("test-pool")).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.submit(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("test-pool-"), "unexpected thread name: {}", name);
    }

    #[test]
    fn runs_submissions_concurrently() {
        let pool = WorkerPool::new(&WorkerPoolConfiguration::new(2)).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            pool.submit(move || {
                barrier.wait();
                tx.send(()).unwrap();
            });
        }

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5))
                .expect("both submissions should run at the same time");
        }
    }
}
