//! Fixed-size pool of workers with least-loaded assignment.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::CoreError;
use crate::job::Job;
use crate::worker::Worker;

/// Smallest pool a [`WorkerPool`] can be built with.
pub const MIN_POOL_SIZE: usize = 2;

/// A fixed set of workers that share incoming jobs.
///
/// Assignment is greedy: each job goes to the worker whose queue is
/// shortest at that instant. Queue depth says nothing about job duration,
/// so a burst of long jobs can still pile onto one worker.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
}

impl WorkerPool {
    /// Creates `size` idle workers named `worker-0` .. `worker-{size-1}`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PoolTooSmall`] if `size` is below
    /// [`MIN_POOL_SIZE`].
    pub fn new(size: usize) -> Result<Self, CoreError> {
        if size < MIN_POOL_SIZE {
            return Err(CoreError::PoolTooSmall {
                requested: size,
                minimum: MIN_POOL_SIZE,
            });
        }
        let workers = (0..size)
            .map(|i| Arc::new(Worker::new(format!("worker-{i}"))))
            .collect();
        Ok(Self { workers })
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// The pool's workers, in creation order.
    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Assigns `job` to the least-loaded worker.
    pub fn assign(&self, job: Arc<dyn Job>) {
        let worker = self.least_loaded();
        debug!(worker = %worker.name(), job = job.name(), "assigning job");
        worker.assign(job);
    }

    /// Starts every worker. Returns `true` if all of them started.
    pub fn start(&self) -> bool {
        self.workers.iter().map(Worker::start).fold(true, |all, ok| all && ok)
    }

    /// Stops every worker. Returns `true` if all of them were running.
    pub fn stop(&self) -> bool {
        self.workers.iter().map(|w| w.stop()).fold(true, |all, ok| all && ok)
    }

    /// Kills every worker and its current job. Returns `true` if all of
    /// them were running.
    pub fn kill(&self) -> bool {
        self.workers.iter().map(|w| w.kill()).fold(true, |all, ok| all && ok)
    }

    /// Returns `true` if any worker is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| w.is_running())
    }

    /// Returns `true` only if every worker has fully stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    /// Waits for every worker to exit, each bounded by `timeout`.
    ///
    /// Returns `true` if all of them finished.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let mut all = true;
        for worker in &self.workers {
            all &= worker.join(timeout).await;
        }
        all
    }

    /// First worker with the strictly smallest queue.
    fn least_loaded(&self) -> &Arc<Worker> {
        let mut best = &self.workers[0];
        let mut best_size = best.queue_size();
        for worker in &self.workers[1..] {
            let size = worker.queue_size();
            if size < best_size {
                best = worker;
                best_size = size;
            }
        }
        best
    }
}
