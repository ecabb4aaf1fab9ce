//! Registry of live clients.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::client::{Client, ClientId};

/// Thread-safe set of the server's connected clients.
///
/// Every mutation happens under a single mutex. The registry also owns the
/// activity signal that registered clients notify when a message arrives.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Arc<Client>>>,
    activity: Arc<Notify>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            activity: Arc::new(Notify::new()),
        }
    }

    /// Signal notified whenever any registered client queues a message.
    #[must_use]
    pub fn activity(&self) -> &Arc<Notify> {
        &self.activity
    }

    /// Inserts `client` and starts its receive loop while holding the guard,
    /// so no other registry call observes a registered client that is not
    /// yet running.
    ///
    /// Returns `false` if a client with the same id is already registered.
    pub fn register(&self, client: Arc<Client>) -> bool {
        let mut clients = self.clients.lock();
        if clients.contains_key(&client.id()) {
            return false;
        }
        client.start();
        clients.insert(client.id(), client);
        true
    }

    /// Removes a client, returning it if it was registered.
    pub fn remove(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.lock().remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Snapshot of all registered clients, ordered by id.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Client>> {
        let mut clients: Vec<_> = self.clients.lock().values().cloned().collect();
        clients.sort_by_key(|client| client.id());
        clients
    }

    /// Registered clients that have at least one message waiting.
    #[must_use]
    pub fn pending_clients(&self) -> Vec<Arc<Client>> {
        self.clients()
            .into_iter()
            .filter(|client| client.has_data())
            .collect()
    }

    /// Stops every registered client.
    ///
    /// The guard is released before stopping, since each stop runs a
    /// disconnect callback that re-enters the registry.
    pub fn disconnect_all(&self) {
        for client in self.clients() {
            client.stop();
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
