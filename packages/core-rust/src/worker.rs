//! A service that drains a private FIFO of jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::info;

use crate::job::Job;
use crate::service::{Routine, Service, StopSignal, MIN_LOOP_RATE};

/// Executes assigned jobs one at a time, in assignment order.
///
/// The queue is lock-free; an idle worker parks on a [`Notify`] until a job
/// is assigned or the worker is stopped.
pub struct Worker {
    service: Service,
    queue: SegQueue<Arc<dyn Job>>,
    wake: Notify,
    current: Mutex<Option<Arc<dyn Job>>>,
}

impl Worker {
    /// Creates an idle worker.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            service: Service::with_rate(name, MIN_LOOP_RATE),
            queue: SegQueue::new(),
            wake: Notify::new(),
            current: Mutex::new(None),
        }
    }

    /// Returns the worker name.
    #[must_use]
    pub fn name(&self) -> String {
        self.service.name()
    }

    /// Returns the underlying service, e.g. to tune its loop rate.
    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Appends a job to the queue and wakes the worker if it is idle.
    ///
    /// Never blocks. Safe to call from any number of producers.
    pub fn assign(&self, job: Arc<dyn Job>) {
        self.queue.push(job);
        // A stored permit covers the window between the worker finding the
        // queue empty and parking.
        self.wake.notify_one();
    }

    /// Number of jobs waiting, not counting one in flight.
    ///
    /// The value may be stale by the time it is read; use it only as a load
    /// hint.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Name of the job currently executing, if any.
    #[must_use]
    pub fn current_job(&self) -> Option<String> {
        self.current.lock().as_ref().map(|job| job.name().to_owned())
    }

    /// Starts the worker loop. See [`Service::start`].
    pub fn start(self: &Arc<Self>) -> bool {
        self.service.start(Arc::clone(self))
    }

    /// Stops the worker after its current job. See [`Service::stop`].
    pub fn stop(&self) -> bool {
        self.service.stop()
    }

    /// Stops the worker and asks the current job, if any, to cancel.
    ///
    /// Does not wait for the job to exit. A job that ignores `kill` keeps
    /// the worker busy until it finishes.
    pub fn kill(&self) -> bool {
        let stopped = self.service.stop();
        let current = self.current.lock().clone();
        if let Some(job) = current {
            job.kill();
            info!(worker = %self.name(), job = job.name(), "job killed");
        }
        stopped
    }

    /// Waits for the worker loop to exit. See [`Service::join`].
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        self.service.join(timeout).await
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.service.is_finished()
    }

    fn pick_up(&self) -> Option<Arc<dyn Job>> {
        let mut current = self.current.lock();
        let job = self.queue.pop();
        *current = job.clone();
        job
    }
}

#[async_trait]
impl Routine for Worker {
    async fn run(&self, stop: &StopSignal) -> anyhow::Result<()> {
        let Some(job) = self.pick_up() else {
            tokio::select! {
                () = self.wake.notified() => {}
                () = stop.stopped() => {}
            }
            return Ok(());
        };

        let worker = self.name();
        info!(worker = %worker, job = job.name(), "job started");
        job.run().await;
        info!(worker = %worker, job = job.name(), "job finished");
        self.current.lock().take();
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("service", &self.service)
            .field("queue_size", &self.queue_size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Records its index on completion and flags any overlapping execution.
    struct Recording {
        index: usize,
        log: Arc<Mutex<Vec<usize>>>,
        busy: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Job for Recording {
        async fn run(&self) {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.log.lock().push(self.index);
            self.busy.store(false, Ordering::SeqCst);
        }

        fn kill(&self) {}
    }

    /// Runs until killed.
    struct Cooperative {
        token: CancellationToken,
        kills: AtomicU32,
    }

    #[async_trait]
    impl Job for Cooperative {
        async fn run(&self) {
            self.token.cancelled().await;
        }

        fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.token.cancel();
        }
    }

    /// Ignores kill and runs for a fixed time.
    struct Stubborn {
        duration: Duration,
        kills: AtomicU32,
    }

    #[async_trait]
    impl Job for Stubborn {
        async fn run(&self) {
            tokio::time::sleep(self.duration).await;
        }

        fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn assign_grows_queue_without_running() {
        let worker = Worker::new("idle");
        let token = CancellationToken::new();
        worker.assign(Arc::new(Cooperative {
            token,
            kills: AtomicU32::new(0),
        }));
        assert_eq!(worker.queue_size(), 1);
        assert!(worker.current_job().is_none());
        assert!(worker.is_finished());
    }

    #[tokio::test]
    async fn jobs_run_in_fifo_order_without_overlap() {
        let worker = Arc::new(Worker::new("fifo"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        for index in 0..5 {
            worker.assign(Arc::new(Recording {
                index,
                log: Arc::clone(&log),
                busy: Arc::clone(&busy),
                overlapped: Arc::clone(&overlapped),
            }));
        }
        assert!(worker.start());

        wait_until(|| log.lock().len() == 5).await;
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert!(!overlapped.load(Ordering::SeqCst));

        worker.stop();
        assert!(worker.join(Some(Duration::from_secs(1))).await);
    }

    #[tokio::test]
    async fn idle_worker_wakes_on_assign() {
        let worker = Arc::new(Worker::new("sleeper"));
        worker.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let log = Arc::new(Mutex::new(Vec::new()));
        worker.assign(Arc::new(Recording {
            index: 7,
            log: Arc::clone(&log),
            busy: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
        }));

        wait_until(|| log.lock().len() == 1).await;
        assert_eq!(worker.queue_size(), 0);

        worker.stop();
        assert!(worker.join(Some(Duration::from_secs(1))).await);
    }

    #[tokio::test]
    async fn stop_wakes_an_idle_worker() {
        let worker = Arc::new(Worker::new("idle"));
        worker.service().set_loop_rate(Duration::from_secs(60)).unwrap();
        worker.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(worker.stop());
        assert!(worker.join(Some(Duration::from_secs(1))).await);
    }

    #[tokio::test]
    async fn kill_cancels_a_cooperative_job() {
        let worker = Arc::new(Worker::new("killer"));
        let job = Arc::new(Cooperative {
            token: CancellationToken::new(),
            kills: AtomicU32::new(0),
        });
        worker.assign(Arc::clone(&job) as Arc<dyn Job>);
        worker.start();
        wait_until(|| worker.current_job().is_some()).await;
        assert_eq!(worker.current_job().as_deref(), Some("Cooperative"));

        assert!(worker.kill());
        assert!(worker.join(Some(Duration::from_secs(1))).await);
        assert_eq!(job.kills.load(Ordering::SeqCst), 1);
        assert!(worker.current_job().is_none());
    }

    #[tokio::test]
    async fn kill_does_not_preempt_a_stubborn_job() {
        let worker = Arc::new(Worker::new("stubborn"));
        let job = Arc::new(Stubborn {
            duration: Duration::from_millis(300),
            kills: AtomicU32::new(0),
        });
        worker.assign(Arc::clone(&job) as Arc<dyn Job>);
        worker.start();
        wait_until(|| worker.current_job().is_some()).await;

        assert!(worker.kill());
        assert_eq!(job.kills.load(Ordering::SeqCst), 1);
        assert!(!worker.join(Some(Duration::from_millis(50))).await);
        assert!(worker.join(Some(Duration::from_secs(2))).await);
    }

    #[tokio::test]
    async fn kill_on_idle_worker_reports_failure() {
        let worker = Worker::new("never-started");
        assert!(!worker.kill());
    }
}
