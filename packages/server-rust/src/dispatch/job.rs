//! Turning inbound requests into jobs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use taskwire_core::Job;
use tracing::warn;

use crate::network::Client;

/// Computes the response to one request payload.
///
/// Payloads are opaque bytes; decoding is the processor's business.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    async fn process(&self, request: Bytes) -> Bytes;
}

/// A job that answers one request on the connection it came from.
///
/// Requests are atomic: once `run` starts it cannot be interrupted.
pub struct RequestProcessorJob<P> {
    processor: Arc<P>,
    client: Arc<Client>,
    request: Bytes,
}

impl<P: RequestProcessor> RequestProcessorJob<P> {
    #[must_use]
    pub fn new(processor: Arc<P>, client: Arc<Client>, request: Bytes) -> Self {
        Self {
            processor,
            client,
            request,
        }
    }

    #[must_use]
    pub fn request(&self) -> &Bytes {
        &self.request
    }
}

#[async_trait]
impl<P: RequestProcessor> Job for RequestProcessorJob<P> {
    async fn run(&self) {
        let response = self.processor.process(self.request.clone()).await;
        self.client.send(response).await;
    }

    fn kill(&self) {
        warn!(
            client = %self.client.id(),
            "cannot kill request processor while it is processing"
        );
    }
}

/// Error returned when a factory cannot build a job for a request.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("request rejected: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Builds the job that will handle one request from `client`.
pub trait JobFactory: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns a [`JobError`] if no job can be built; the request is dropped.
    fn create(&self, client: Arc<Client>, request: Bytes) -> Result<Arc<dyn Job>, JobError>;
}

impl<F> JobFactory for F
where
    F: Fn(Arc<Client>, Bytes) -> Result<Arc<dyn Job>, JobError> + Send + Sync + 'static,
{
    fn create(&self, client: Arc<Client>, request: Bytes) -> Result<Arc<dyn Job>, JobError> {
        self(client, request)
    }
}

/// Factory wrapping every request in a [`RequestProcessorJob`] that shares
/// one processor.
pub struct ProcessorFactory<P> {
    processor: Arc<P>,
}

impl<P: RequestProcessor> ProcessorFactory<P> {
    #[must_use]
    pub fn new(processor: P) -> Self {
        Self::shared(Arc::new(processor))
    }

    #[must_use]
    pub fn shared(processor: Arc<P>) -> Self {
        Self { processor }
    }
}

impl<P: RequestProcessor> JobFactory for ProcessorFactory<P> {
    fn create(&self, client: Arc<Client>, request: Bytes) -> Result<Arc<dyn Job>, JobError> {
        Ok(Arc::new(RequestProcessorJob::new(
            Arc::clone(&self.processor),
            client,
            request,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt};

    use super::*;
    use crate::network::ClientConfig;

    struct Upper;

    #[async_trait]
    impl RequestProcessor for Upper {
        async fn process(&self, request: Bytes) -> Bytes {
            Bytes::from(request.to_ascii_uppercase())
        }
    }

    #[tokio::test]
    async fn run_sends_processed_response_to_the_requester() {
        let (ours, mut theirs) = duplex(256);
        let client = Arc::new(Client::from_stream(ours, ClientConfig::default()).unwrap());
        let factory = ProcessorFactory::new(Upper);

        let job = factory
            .create(Arc::clone(&client), Bytes::from_static(b"hey"))
            .unwrap();
        assert_eq!(job.name(), "RequestProcessorJob");
        job.run().await;

        let mut buf = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(1), theirs.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, &[0, 0, 0, 3, b'H', b'E', b'Y']);
    }

    #[tokio::test]
    async fn run_after_client_released_returns_normally() {
        let (ours, theirs) = duplex(64);
        let client = Arc::new(Client::from_stream(ours, ClientConfig::default()).unwrap());
        assert!(client.start());
        assert!(client.stop());
        assert!(client.join(Some(Duration::from_secs(1))).await);
        drop(theirs);

        let job = RequestProcessorJob::new(Arc::new(Upper), client, Bytes::from_static(b"late"));
        tokio::time::timeout(Duration::from_secs(1), job.run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn kill_does_not_interrupt() {
        let (ours, _theirs) = duplex(64);
        let client = Arc::new(Client::from_stream(ours, ClientConfig::default()).unwrap());
        let job = RequestProcessorJob::new(Arc::new(Upper), client, Bytes::from_static(b"x"));
        job.kill();
        assert_eq!(job.request().as_ref(), b"x");
    }

    #[test]
    fn closures_are_factories() {
        let reject = |_client: Arc<Client>, _request: Bytes| -> Result<Arc<dyn Job>, JobError> {
            Err(JobError::Rejected {
                reason: "closed".into(),
            })
        };
        let factory: Box<dyn JobFactory> = Box::new(reject);
        let (ours, _theirs) = duplex(64);
        let client = Arc::new(Client::from_stream(ours, ClientConfig::default()).unwrap());
        let err = factory.create(client, Bytes::new()).err().unwrap();
        assert_eq!(err.to_string(), "request rejected: closed");
    }
}
