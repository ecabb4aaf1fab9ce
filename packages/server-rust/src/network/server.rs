//! The server: listener, client registry and the two manager services.
//!
//! ```text
//! ClientManager --accept--> ClientRegistry --activity--> RequestManager
//!                                                           | JobFactory
//!                                                           v
//!                  Client <------- send ------- Worker <- WorkerPool
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use taskwire_core::WorkerPool;
use tokio::net::TcpListener;
use tracing::info;

use super::client::{Client, ClientId};
use super::client_manager::ClientManager;
use super::config::{ClientConfig, ServerConfig};
use super::registry::ClientRegistry;
use crate::dispatch::{JobFactory, ProcessorFactory, RequestManager, RequestProcessor};
use crate::error::ServerError;

/// State shared between the server handle, the accept loop and every
/// client's disconnect callback.
#[derive(Debug)]
pub(crate) struct ServerShared {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    config: ServerConfig,
}

impl ServerShared {
    /// Waits up to the accept timeout for one connection and wraps it in a
    /// client wired to this server. The client is not registered.
    pub(crate) async fn accept(self: &Arc<Self>) -> Result<Arc<Client>, ServerError> {
        let (stream, peer) =
            tokio::time::timeout(self.config.accept_timeout, self.listener.accept())
                .await
                .map_err(|_| ServerError::AcceptTimeout)??;

        let server = Arc::downgrade(self);
        let client = Client::from_stream(stream, self.config.client.clone())?
            .with_peer(peer)
            .with_listener(Arc::clone(self.registry.activity()))
            .on_disconnect(move |client| notify_disconnect(&server, client));
        Ok(Arc::new(client))
    }

    pub(crate) fn add_client(&self, client: Arc<Client>) -> bool {
        let id = client.id();
        let peer = client.peer_addr();
        let added = self.registry.register(client);
        if added {
            info!(client = %id, peer = ?peer, "client connected");
        }
        added
    }

    pub(crate) fn on_client_disconnect(&self, client: &Client) {
        if self.registry.remove(client.id()).is_some() {
            info!(client = %client.id(), "client disconnected");
        }
    }

    pub(crate) fn disconnect_all_clients(&self) {
        self.registry.disconnect_all();
    }
}

fn notify_disconnect(server: &Weak<ServerShared>, client: &Client) {
    if let Some(server) = server.upgrade() {
        server.on_client_disconnect(client);
    }
}

/// A TCP server that turns every inbound message into a job.
#[derive(Debug)]
pub struct Server {
    shared: Arc<ServerShared>,
    client_manager: Arc<ClientManager>,
    request_manager: Arc<RequestManager>,
}

impl Server {
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Builds a server around an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Core`] if the configured pool size or loop
    /// rate is invalid.
    pub fn from_listener(
        listener: TcpListener,
        config: ServerConfig,
        factory: Arc<dyn JobFactory>,
    ) -> Result<Self, ServerError> {
        let registry = Arc::new(ClientRegistry::new());
        let request_manager = prepare_request_manager(&registry, &config, factory)?;
        Self::assemble(listener, config, registry, request_manager)
    }

    fn assemble(
        listener: TcpListener,
        config: ServerConfig,
        registry: Arc<ClientRegistry>,
        request_manager: RequestManager,
    ) -> Result<Self, ServerError> {
        let loop_rate = config.loop_rate;
        let shared = Arc::new(ServerShared {
            listener,
            registry,
            config,
        });
        let client_manager = ClientManager::new(Arc::clone(&shared), loop_rate)?;
        Ok(Self {
            shared,
            client_manager: Arc::new(client_manager),
            request_manager: Arc::new(request_manager),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.shared.listener.local_addr()?)
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        self.request_manager.pool()
    }

    /// Starts accepting connections and dispatching requests.
    ///
    /// Returns `true` only if every service started.
    pub fn start(&self) -> bool {
        let clients = self.client_manager.start();
        let requests = self.request_manager.start();
        info!(addr = ?self.local_addr().ok(), "server started");
        clients && requests
    }

    /// Stops dispatching, lets workers finish their current jobs, then stops
    /// accepting and disconnects every client.
    pub fn stop(&self) -> bool {
        info!("server shutting down");
        let requests = self.request_manager.stop();
        let clients = self.client_manager.stop();
        requests && clients
    }

    /// Like [`stop`](Self::stop), but also asks in-flight jobs to cancel.
    pub fn kill(&self) -> bool {
        let requests = self.request_manager.kill();
        let clients = self.client_manager.stop();
        requests && clients
    }

    /// Waits for the accept loop, the dispatch loop and every worker, each
    /// bounded by `timeout`.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let clients = self.client_manager.join(timeout).await;
        let requests = self.request_manager.join(timeout).await;
        clients && requests
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.client_manager.is_running() || self.request_manager.is_running()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.client_manager.is_finished() && self.request_manager.is_finished()
    }

    /// Accepts one connection directly, bypassing the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AcceptTimeout`] if nobody connects within the
    /// accept timeout, or [`ServerError::Io`] if accepting fails.
    pub async fn accept(&self) -> Result<Arc<Client>, ServerError> {
        self.shared.accept().await
    }

    /// Registers `client` and starts its receive loop.
    ///
    /// Returns `false` if it was already registered.
    pub fn add_client(&self, client: Arc<Client>) -> bool {
        self.shared.add_client(client)
    }

    /// Deregisters `client`. Called automatically when an accepted client
    /// stops.
    pub fn on_client_disconnect(&self, client: &Client) {
        self.shared.on_client_disconnect(client);
    }

    /// Terminates one client's connection.
    ///
    /// Returns `false` if no running client has that id.
    pub fn disconnect_client(&self, id: ClientId) -> bool {
        let Some(client) = self.shared.registry.get(id) else {
            return false;
        };
        let stopped = client.stop();
        if stopped {
            info!(client = %id, "server terminated connection with client");
        }
        stopped
    }

    pub fn disconnect_all_clients(&self) {
        self.shared.disconnect_all_clients();
    }

    /// Snapshot of the connected clients, ordered by id.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.shared.registry.clients()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.registry.count()
    }
}

fn prepare_request_manager(
    registry: &Arc<ClientRegistry>,
    config: &ServerConfig,
    factory: Arc<dyn JobFactory>,
) -> Result<RequestManager, ServerError> {
    let pool = WorkerPool::new(config.pool_size)?;
    let manager = RequestManager::new(Arc::clone(registry), pool, factory, config.loop_rate)?;
    Ok(manager)
}

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    factory: Option<Arc<dyn JobFactory>>,
}

impl ServerBuilder {
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    #[must_use]
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    #[must_use]
    pub fn loop_rate(mut self, rate: Duration) -> Self {
        self.config.loop_rate = rate;
        self
    }

    #[must_use]
    pub fn client(mut self, client: ClientConfig) -> Self {
        self.config.client = client;
        self
    }

    #[must_use]
    pub fn job_factory<F: JobFactory>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Handles every request with `processor`.
    #[must_use]
    pub fn processor<P: RequestProcessor>(self, processor: P) -> Self {
        self.job_factory(ProcessorFactory::new(processor))
    }

    /// Validates the configuration and binds the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::MissingJobFactory`] without a factory,
    /// [`ServerError::Core`] for an invalid pool size or loop rate, and
    /// [`ServerError::Io`] if the address cannot be bound.
    pub async fn bind(self) -> Result<Server, ServerError> {
        let factory = self.factory.ok_or(ServerError::MissingJobFactory)?;
        let registry = Arc::new(ClientRegistry::new());
        let request_manager = prepare_request_manager(&registry, &self.config, factory)?;

        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!(addr = ?listener.local_addr().ok(), "server bound");
        Server::assemble(listener, self.config, registry, request_manager)
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}
