//! Accept loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskwire_core::{CoreError, Routine, Service, StopSignal};
use tracing::{debug, error};

use super::client::Client;
use super::server::ServerShared;
use crate::error::ServerError;

/// Service that accepts one connection per iteration and registers it.
pub struct ClientManager {
    service: Service,
    shared: Arc<ServerShared>,
}

impl ClientManager {
    pub(crate) fn new(shared: Arc<ServerShared>, loop_rate: Duration) -> Result<Self, CoreError> {
        let service = Service::new("client-manager");
        service.set_loop_rate(loop_rate)?;
        Ok(Self { service, shared })
    }

    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn start(self: &Arc<Self>) -> bool {
        self.service.start(Arc::clone(self))
    }

    /// Stops accepting and disconnects every registered client.
    pub fn stop(&self) -> bool {
        let stopped = self.service.stop();
        self.shared.disconnect_all_clients();
        stopped
    }

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

    /// Registers a freshly accepted client unless shutdown has begun.
    ///
    /// `stop` flips the service state before it disconnects everyone, so a
    /// client registered after that snapshot is caught by the second check.
    pub(crate) fn admit(&self, client: Arc<Client>) -> bool {
        if !self.service.is_running() {
            debug!(client = %client.id(), "dropping connection accepted during shutdown");
            return false;
        }
        if !self.shared.add_client(Arc::clone(&client)) {
            return false;
        }
        if !self.service.is_running() {
            client.stop();
            return false;
        }
        true
    }
}

#[async_trait]
impl Routine for ClientManager {
    async fn run(&self, stop: &StopSignal) -> anyhow::Result<()> {
        let accepted = tokio::select! {
            accepted = self.shared.accept() => accepted,
            () = stop.stopped() => return Ok(()),
        };
        match accepted {
            Ok(client) => {
                self.admit(client);
            }
            Err(ServerError::AcceptTimeout) => {}
            Err(e) => error!("failed to accept connection: {e}"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
