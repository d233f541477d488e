//! The worker itself: one generation of the offline layer, with an explicit
//! dispatcher from event kind to async handler.

use dailymeal_net::{Fetcher, Request};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::clients::{ClientId, Clients};
use crate::handlers::{FetchHandlers, FetchResponse};
use crate::lifecycle::{self, WorkerState};
use crate::message::{PageMessage, WorkerMessage};
use crate::router::{RoutePolicy, Router};
use crate::{ServiceWorkerError, WorkerConfig};

/// Unique identifier for a worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self { request }
    }

    pub fn is_navigation(&self) -> bool {
        self.request.is_navigation()
    }
}

/// Result of handling a fetch event.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The worker did not intercept; the page should go to the network itself.
    Passthrough,
    /// The worker answered.
    Respond(FetchResponse),
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchOutcome::Passthrough => None,
            FetchOutcome::Respond(response) => Some(response),
        }
    }
}

/// Events delivered to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message { source: ClientId, data: JsonValue },
}

/// Result of dispatching a [`WorkerEvent`].
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Installed { cached: usize },
    Activated { purged: Vec<String> },
    Fetch(FetchOutcome),
    Relayed { recipients: usize },
    Ignored,
}

/// One worker generation.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    scope: Url,
    config: Arc<WorkerConfig>,
    router: Router,
    handlers: FetchHandlers,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    state: RwLock<WorkerState>,
}

impl ServiceWorker {
    /// Create a worker for `scope`. Nothing runs until [`WorkerEvent::Install`].
    pub fn new(
        scope: Url,
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Fetcher>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            id: ServiceWorkerId::new(),
            scope,
            router: Router::new(&config),
            handlers: FetchHandlers::new(config.clone(), store.clone(), network.clone()),
            config,
            store,
            network,
            clients: Arc::new(RwLock::new(Clients::new())),
            state: RwLock::new(WorkerState::Parsed),
        }
    }

    /// Share a page registry with other generations of the same scope.
    pub fn with_clients(mut self, clients: Arc<RwLock<Clients>>) -> Self {
        self.clients = clients;
        self
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        self.clients.clone()
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == WorkerState::Activated
    }

    /// Move to `next`, rejecting out-of-order steps.
    pub(crate) async fn set_state(&self, next: WorkerState) -> Result<(), ServiceWorkerError> {
        let mut state = self.state.write().await;
        if !state.can_transition_to(next) {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move from {:?} to {:?}",
                *state, next
            )));
        }
        trace!(worker = self.id.raw(), from = ?*state, to = ?next, "State change");
        *state = next;
        Ok(())
    }

    /// Mark as activated without running install/activate again, for a
    /// generation whose caches survived a restart.
    pub(crate) async fn restore_activated(&self) {
        *self.state.write().await = WorkerState::Activated;
    }

    /// Route an event to its handler.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => {
                let cached = self.install().await?;
                Ok(EventOutcome::Installed { cached })
            }
            WorkerEvent::Activate => {
                let purged = self.activate().await?;
                Ok(EventOutcome::Activated { purged })
            }
            WorkerEvent::Fetch(event) => Ok(EventOutcome::Fetch(self.handle_fetch(event).await)),
            WorkerEvent::Message { source, data } => {
                Ok(match self.handle_message(source, data).await {
                    Some(recipients) => EventOutcome::Relayed { recipients },
                    None => EventOutcome::Ignored,
                })
            }
        }
    }

    /// Install event: cache the static manifest. A failure makes this
    /// generation redundant.
    #[instrument(skip(self), fields(worker = self.id.raw()))]
    pub async fn install(&self) -> Result<usize, ServiceWorkerError> {
        self.set_state(WorkerState::Installing).await?;

        match lifecycle::install(
            &self.config,
            &self.scope,
            self.store.as_ref(),
            self.network.as_ref(),
        )
        .await
        {
            Ok(cached) => {
                self.set_state(WorkerState::Installed).await?;
                Ok(cached)
            }
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.set_state(WorkerState::Redundant).await?;
                Err(e)
            }
        }
    }

    /// Activate event: purge stale caches, then claim open pages.
    #[instrument(skip(self), fields(worker = self.id.raw()))]
    pub async fn activate(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.set_state(WorkerState::Activating).await?;

        let purged = match lifecycle::activate(&self.config, self.store.as_ref()).await {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "Activate failed");
                self.set_state(WorkerState::Redundant).await?;
                return Err(e);
            }
        };

        self.set_state(WorkerState::Activated).await?;

        if self.config.claim_clients {
            self.clients.write().await.claim();
        }

        info!(purged = purged.len(), "Worker activated");
        Ok(purged)
    }

    /// Fetch event. Only an activated worker intercepts.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchOutcome {
        if !self.is_active().await {
            trace!(url = %event.request.url, "Worker not active, passing through");
            return FetchOutcome::Passthrough;
        }

        let policy = self.router.classify(&event.request.url);
        debug!(url = %event.request.url, method = %event.request.method, ?policy, "Fetch");

        match policy {
            RoutePolicy::Passthrough => FetchOutcome::Passthrough,
            RoutePolicy::NetworkFirst => {
                FetchOutcome::Respond(self.handlers.network_first(event.request).await)
            }
            RoutePolicy::CacheFirst => {
                FetchOutcome::Respond(self.handlers.cache_first(event.request).await)
            }
        }
    }

    /// Wait for API cache writes still running in the background.
    pub async fn flush_cache_writes(&self) {
        self.handlers.flush().await;
    }

    /// Message event. Returns the number of pages a status update reached,
    /// or `None` when the message was ignored.
    pub async fn handle_message(&self, source: ClientId, data: JsonValue) -> Option<usize> {
        match PageMessage::from_value(data) {
            PageMessage::NetworkStatus { online } => {
                let update = WorkerMessage::NetworkStatusUpdate { online };
                let recipients = self.clients.write().await.broadcast_except(source, update);
                debug!(source = source.raw(), online, recipients, "Relayed network status");
                Some(recipients)
            }
            PageMessage::Unknown => {
                trace!(source = source.raw(), "Ignoring unrecognized message");
                None
            }
        }
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("scope", &self.scope.as_str())
            .field("static_cache", &self.config.static_cache_name)
            .field("api_cache", &self.config.api_cache_name)
            .finish_non_exhaustive()
    }
}
