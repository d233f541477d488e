//! Open pages and the status relay between them.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::message::WorkerMessage;
use crate::ServiceWorkerError;

/// Unique identifier for an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Whether an active worker controls this page.
    pub controlled: bool,

    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl Client {
    /// Post message to client.
    pub fn post_message(&self, message: WorkerMessage) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(message)
            .map_err(|_| ServiceWorkerError::StateError(format!("client {:?} is closed", self.id)))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open page; the receiver is the page's inbox.
    pub fn add(&mut self, url: Url) -> (ClientId, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        self.clients.insert(
            id,
            Client {
                id,
                url,
                controlled: false,
                tx,
            },
        );
        (id, rx)
    }

    /// Get a client by ID.
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    /// All client ids, sorted.
    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Take control of every open page. Returns how many were newly claimed.
    pub fn claim(&mut self) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if !client.controlled {
                client.controlled = true;
                claimed += 1;
            }
        }
        debug!(claimed, total = self.clients.len(), "Clients claimed");
        claimed
    }

    /// Send `message` to every page except `source`. Closed pages are dropped.
    ///
    /// Returns the number of pages that received it.
    pub fn broadcast_except(&mut self, source: ClientId, message: WorkerMessage) -> usize {
        self.clients.retain(|_, client| !client.is_closed());

        let mut delivered = 0;
        for client in self.clients.values() {
            if client.id == source {
                continue;
            }
            match client.post_message(message) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(client = client.id.raw(), error = %e, "Skipped closed client"),
            }
        }
        delivered
    }
}
