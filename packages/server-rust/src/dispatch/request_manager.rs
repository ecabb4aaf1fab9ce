//! Moves queued client messages onto the worker pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskwire_core::{CoreError, Routine, Service, StopSignal, WorkerPool};
use tracing::{debug, error};

use super::job::JobFactory;
use crate::network::ClientRegistry;

/// Service that turns each received message into a job and hands it to
/// the least-loaded worker.
///
/// While no registered client has data it parks on the registry's activity
/// signal. Each pass takes at most one message per client, so one chatty
/// client cannot starve the others within a pass.
pub struct RequestManager {
    service: Service,
    registry: Arc<ClientRegistry>,
    pool: WorkerPool,
    factory: Arc<dyn JobFactory>,
}

impl RequestManager {
    /// # Errors
    ///
    /// Returns [`CoreError::LoopRateTooLow`] if `loop_rate` is below the
    /// minimum.
    pub fn new(
        registry: Arc<ClientRegistry>,
        pool: WorkerPool,
        factory: Arc<dyn JobFactory>,
        loop_rate: Duration,
    ) -> Result<Self, CoreError> {
        let service = Service::new("request-manager");
        service.set_loop_rate(loop_rate)?;
        Ok(Self {
            service,
            registry,
            pool,
            factory,
        })
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Starts the worker pool, then the dispatch loop.
    ///
    /// Returns `true` only if both started.
    pub fn start(self: &Arc<Self>) -> bool {
        let pool = self.pool.start();
        let service = self.service.start(Arc::clone(self));
        pool && service
    }

    /// Stops the dispatch loop and every worker after its current job.
    pub fn stop(&self) -> bool {
        let service = self.service.stop();
        let pool = self.pool.stop();
        service && pool
    }

    /// Stops the dispatch loop and kills every worker's current job.
    pub fn kill(&self) -> bool {
        let service = self.service.stop();
        let pool = self.pool.kill();
        service && pool
    }

    /// Waits for the dispatch loop and then the pool, each bounded by
    /// `timeout`.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let service = self.service.join(timeout).await;
        let pool = self.pool.join(timeout).await;
        service && pool
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.service.is_finished() && self.pool.is_finished()
    }

    fn dispatch_pending(&self) -> bool {
        let pending = self.registry.pending_clients();
        if pending.is_empty() {
            return false;
        }
        for client in pending {
            let Some(request) = client.receive() else {
                continue;
            };
            match self.factory.create(Arc::clone(&client), request) {
                Ok(job) => self.pool.assign(job),
                Err(e) => error!(client = %client.id(), "failed to create job for request: {e}"),
            }
        }
        true
    }
}

#[async_trait]
impl Routine for RequestManager {
    async fn run(&self, stop: &StopSignal) -> anyhow::Result<()> {
        if !self.dispatch_pending() {
            tokio::select! {
                () = self.registry.activity().notified() => debug!("client activity"),
                () = stop.stopped() => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestManager")
            .field("service", &self.service)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bytes::Bytes;
    use taskwire_core::Job;
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;
    use crate::dispatch::JobError;
    use crate::network::{Client, ClientConfig};

    struct Count(Arc<AtomicU32>);

    #[async_trait]
    impl Job for Count {
        async fn run(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn kill(&self) {}
    }

    fn manager(
        registry: &Arc<ClientRegistry>,
        factory: Arc<dyn JobFactory>,
    ) -> Arc<RequestManager> {
        let pool = WorkerPool::new(2).unwrap();
        Arc::new(
            RequestManager::new(
                Arc::clone(registry),
                pool,
                factory,
                taskwire_core::MIN_LOOP_RATE,
            )
            .unwrap(),
        )
    }

    async fn wait_for(counter: &AtomicU32, expected: u32) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("counter stuck at {}", counter.load(Ordering::SeqCst));
    }

    #[test]
    fn rejects_loop_rate_below_minimum() {
        let registry = Arc::new(ClientRegistry::new());
        let factory: Arc<dyn JobFactory> =
            Arc::new(|_: Arc<Client>, _: Bytes| -> Result<Arc<dyn Job>, JobError> {
                Err(JobError::Rejected { reason: "unused".into() })
            });
        let result = RequestManager::new(
            registry,
            WorkerPool::new(2).unwrap(),
            factory,
            Duration::from_millis(1),
        );
        assert!(matches!(result, Err(CoreError::LoopRateTooLow { .. })));
    }

    #[tokio::test]
    async fn every_message_becomes_a_job() {
        let registry = Arc::new(ClientRegistry::new());
        let done = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&done);
        let factory: Arc<dyn JobFactory> = Arc::new(
            move |_: Arc<Client>, _: Bytes| -> Result<Arc<dyn Job>, JobError> {
                Ok(Arc::new(Count(Arc::clone(&counter))))
            },
        );
        let rm = manager(&registry, factory);
        assert!(rm.start());

        let (ours, mut theirs) = duplex(1024);
        let client = Client::from_stream(ours, ClientConfig::default())
            .unwrap()
            .with_listener(Arc::clone(registry.activity()));
        registry.register(Arc::new(client));

        for _ in 0..3 {
            theirs.write_all(&[0, 0, 0, 1, b'q']).await.unwrap();
        }
        wait_for(&done, 3).await;

        assert!(rm.stop());
        assert!(rm.join(Some(Duration::from_secs(1))).await);
        assert!(rm.is_finished());
        registry.disconnect_all();
    }

    #[tokio::test]
    async fn factory_errors_drop_the_message_and_keep_going() {
        let registry = Arc::new(ClientRegistry::new());
        let done = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&done);
        let factory: Arc<dyn JobFactory> = Arc::new(
            move |_: Arc<Client>, request: Bytes| -> Result<Arc<dyn Job>, JobError> {
                if request.as_ref() == b"bad" {
                    return Err(JobError::Rejected {
                        reason: "bad request".into(),
                    });
                }
                Ok(Arc::new(Count(Arc::clone(&counter))))
            },
        );
        let rm = manager(&registry, factory);
        rm.start();

        let (ours, mut theirs) = duplex(1024);
        let client = Arc::new(
            Client::from_stream(ours, ClientConfig::default())
                .unwrap()
                .with_listener(Arc::clone(registry.activity())),
        );
        registry.register(Arc::clone(&client));

        theirs.write_all(&[0, 0, 0, 3, b'b', b'a', b'd']).await.unwrap();
        theirs.write_all(&[0, 0, 0, 2, b'o', b'k']).await.unwrap();
        wait_for(&done, 1).await;
        assert!(rm.is_running());
        assert_eq!(client.pending(), 0);

        rm.stop();
        assert!(rm.join(Some(Duration::from_secs(1))).await);
        registry.disconnect_all();
    }

    #[tokio::test]
    async fn stop_wakes_an_idle_manager() {
        let registry = Arc::new(ClientRegistry::new());
        let factory: Arc<dyn JobFactory> =
            Arc::new(|_: Arc<Client>, _: Bytes| -> Result<Arc<dyn Job>, JobError> {
                Err(JobError::Rejected { reason: "unused".into() })
            });
        let rm = manager(&registry, factory);
        rm.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(rm.stop());
        assert!(rm.join(Some(Duration::from_secs(1))).await);
        assert!(!rm.stop());
    }
}
