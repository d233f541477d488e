//! Page-side bootstrap: registering worker generations, routing page fetches
//! to the controlling worker, and connecting pages to the status relay.
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── Registration (per scope)
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     └── Clients (shared by every generation)
//!             └── Page inboxes
//! ```

use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use url::Url;

use crate::clients::{ClientId, Clients};
use crate::lifecycle::WorkerState;
use crate::message::{PageMessage, WorkerMessage};
use crate::worker::{FetchEvent, FetchOutcome, ServiceWorker, ServiceWorkerId};
use crate::ServiceWorkerError;

// ==================== Registration ====================

/// Worker generations for one scope.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<Arc<ServiceWorker>>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<Arc<ServiceWorker>>,

    /// Active worker.
    pub active: Option<Arc<ServiceWorker>>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&Arc<ServiceWorker>> {
        self.active.as_ref()
    }

    /// Start installing a new generation, superseding any half-installed one.
    async fn begin_install(&mut self, worker: Arc<ServiceWorker>) {
        if let Some(previous) = self.installing.replace(worker) {
            let _ = previous.set_state(WorkerState::Redundant).await;
        }
    }

    /// Transition installing to waiting.
    fn install_complete(&mut self, id: ServiceWorkerId) -> bool {
        match self.installing.take() {
            Some(worker) if worker.id() == id => {
                if let Some(old) = self.waiting.replace(worker) {
                    warn!(worker = old.id().raw(), "Waiting worker superseded");
                }
                true
            }
            other => {
                self.installing = other;
                false
            }
        }
    }

    /// Drop a generation whose install failed; the active worker keeps serving.
    fn install_failed(&mut self, id: ServiceWorkerId) {
        if self.installing.as_ref().map(|w| w.id()) == Some(id) {
            self.installing = None;
        }
    }

    /// Replace the active worker with the waiting one after it activated.
    async fn promote_waiting(&mut self, id: ServiceWorkerId) -> bool {
        match self.waiting.take() {
            Some(worker) if worker.id() == id => {
                if let Some(old) = self.active.replace(worker) {
                    let _ = old.set_state(WorkerState::Redundant).await;
                }
                true
            }
            other => {
                self.waiting = other;
                false
            }
        }
    }

    /// Mark every generation redundant.
    async fn unregister(&mut self) {
        for worker in [
            self.installing.take(),
            self.waiting.take(),
            self.active.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = worker.set_state(WorkerState::Redundant).await;
        }
    }
}

// ==================== Container Events ====================

/// Container events, for page-level observers.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// A new generation started installing.
    UpdateFound { scope: String },
    /// A generation changed lifecycle state.
    StateChange {
        scope: String,
        worker_id: ServiceWorkerId,
        new_state: WorkerState,
    },
    /// A new generation now controls the scope.
    ControllerChange {
        scope: String,
        worker_id: ServiceWorkerId,
    },
    /// Registration failed; the page keeps working without offline support.
    RegistrationFailed { scope: String, error: String },
}

// ==================== Page ====================

/// An open page connected to the container.
#[derive(Debug)]
pub struct Page {
    pub id: ClientId,
    pub url: Url,
    online: bool,
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl Page {
    /// Last known connectivity, from this page's own events or a relayed update.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Record a host connectivity event. Returns the message to post to the
    /// worker when the state actually changed.
    pub fn network_changed(&mut self, online: bool) -> Option<PageMessage> {
        if self.online == online {
            return None;
        }
        self.online = online;
        Some(PageMessage::NetworkStatus { online })
    }

    /// Drain relayed messages, applying status updates.
    pub fn poll_messages(&mut self) -> Vec<WorkerMessage> {
        let mut received = Vec::new();
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                WorkerMessage::NetworkStatusUpdate { online } => self.online = online,
            }
            received.push(message);
        }
        received
    }

    /// Wait for the next relayed message.
    pub async fn next_message(&mut self) -> Option<WorkerMessage> {
        let message = self.inbox.recv().await?;
        match message {
            WorkerMessage::NetworkStatusUpdate { online } => self.online = online,
        }
        Some(message)
    }
}

// ==================== Container ====================

/// Service worker container (the page-side registration API).
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, Registration>>>,

    /// Open pages.
    clients: Arc<RwLock<Clients>>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ContainerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ContainerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker: &ServiceWorker, new_state: WorkerState) {
        self.emit(ContainerEvent::StateChange {
            scope: scope.to_string(),
            worker_id: worker.id(),
            new_state,
        });
    }

    /// Register a worker generation loaded from `script_url`.
    ///
    /// Runs install, then activates immediately when the worker is configured
    /// to skip waiting or nothing is active yet. On failure the error is
    /// logged, any previously active generation keeps serving, and nothing is
    /// retried.
    pub async fn register(
        &self,
        script_url: &str,
        worker: ServiceWorker,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let scope_str = worker.scope().to_string();

        match self.try_register(script_url, worker).await {
            Ok(id) => {
                info!(scope = %scope_str, worker = id.raw(), "Service worker registered");
                Ok(id)
            }
            Err(e) => {
                error!(scope = %scope_str, script = %script_url, error = %e, "Service worker registration failed");
                self.emit(ContainerEvent::RegistrationFailed {
                    scope: scope_str,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn try_register(
        &self,
        script_url: &str,
        worker: ServiceWorker,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let scope = worker.scope().clone();

        if script_url.origin() != scope.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {script_url} is not same-origin with scope {scope}"
            )));
        }
        let script_dir = match script_url.path().rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/"),
            None => "/".to_string(),
        };
        if !scope.path().starts_with(&script_dir) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {scope} is outside the script directory"
            )));
        }

        let scope_str = scope.to_string();
        let worker = Arc::new(worker.with_clients(self.clients.clone()));
        let id = worker.id();

        self.registrations
            .write()
            .await
            .entry(scope_str.clone())
            .or_insert_with(|| Registration::new(scope.clone()))
            .begin_install(worker.clone())
            .await;
        self.emit(ContainerEvent::UpdateFound {
            scope: scope_str.clone(),
        });

        // The lock is released while installing so the old generation keeps serving.
        if let Err(e) = worker.install().await {
            if let Some(registration) = self.registrations.write().await.get_mut(&scope_str) {
                registration.install_failed(id);
            }
            self.emit_state(&scope_str, &worker, WorkerState::Redundant);
            return Err(e);
        }

        let has_active = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;
            if !registration.install_complete(id) {
                return Err(ServiceWorkerError::StateError(
                    "superseded by a newer registration during install".to_string(),
                ));
            }
            registration.active.is_some()
        };
        self.emit_state(&scope_str, &worker, WorkerState::Installed);

        if worker.config().skip_waiting || !has_active {
            self.activate(&scope_str).await?;
        }

        Ok(id)
    }

    /// Activate the waiting worker of `scope`.
    pub async fn activate(&self, scope: &str) -> Result<(), ServiceWorkerError> {
        let worker = self
            .registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.waiting.clone())
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("no waiting worker for {scope}")))?;

        if let Err(e) = worker.activate().await {
            if let Some(registration) = self.registrations.write().await.get_mut(scope) {
                if registration.waiting.as_ref().map(|w| w.id()) == Some(worker.id()) {
                    registration.waiting = None;
                }
            }
            self.emit_state(scope, &worker, WorkerState::Redundant);
            return Err(e);
        }

        let promoted = match self.registrations.write().await.get_mut(scope) {
            Some(registration) => registration.promote_waiting(worker.id()).await,
            None => false,
        };
        if !promoted {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} is no longer waiting",
                worker.id().raw()
            )));
        }

        self.emit_state(scope, &worker, WorkerState::Activated);
        self.emit(ContainerEvent::ControllerChange {
            scope: scope.to_string(),
            worker_id: worker.id(),
        });
        Ok(())
    }

    /// Install `worker` as the active generation without running install or
    /// activate, for caches restored from a previous session.
    pub async fn restore(&self, worker: ServiceWorker) -> ServiceWorkerId {
        let scope = worker.scope().clone();
        let worker = Arc::new(worker.with_clients(self.clients.clone()));
        worker.restore_activated().await;

        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .entry(scope.to_string())
            .or_insert_with(|| Registration::new(scope.clone()));
        if let Some(old) = registration.active.replace(worker.clone()) {
            let _ = old.set_state(WorkerState::Redundant).await;
        }

        info!(scope = %scope, worker = worker.id().raw(), "Restored active worker");
        worker.id()
    }

    /// Scope that controls `url` (longest match).
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;

        registrations
            .keys()
            .filter(|scope| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|scope| scope.len())
            .cloned()
    }

    /// Get all registrations.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Active worker for `url`, if any.
    pub async fn controller(&self, url: &Url) -> Option<Arc<ServiceWorker>> {
        let scope = self.get_registration(url.as_str()).await?;
        self.registrations
            .read()
            .await
            .get(&scope)
            .and_then(|r| r.get_active().cloned())
    }

    /// Route a page request through its controlling worker.
    pub async fn fetch(&self, event: FetchEvent) -> FetchOutcome {
        match self.controller(&event.request.url).await {
            Some(worker) => worker.handle_fetch(event).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Open a page at `url` and connect it to the status relay.
    pub async fn connect_page(&self, url: Url) -> Page {
        let controlled = self.controller(&url).await.is_some();
        let mut clients = self.clients.write().await;
        let (id, inbox) = clients.add(url.clone());
        if controlled {
            clients.claim();
        }

        Page {
            id,
            url,
            online: true,
            inbox,
        }
    }

    /// Close a page.
    pub async fn disconnect_page(&self, page: Page) {
        self.clients.write().await.remove(page.id);
    }

    /// Post a message from `page` to its controlling worker.
    ///
    /// Returns how many other pages received the relayed update.
    pub async fn post_message(
        &self,
        page: &Page,
        data: JsonValue,
    ) -> Result<Option<usize>, ServiceWorkerError> {
        let worker = self
            .controller(&page.url)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("no controller for {}", page.url)))?;
        Ok(worker.handle_message(page.id, data).await)
    }

    /// Record a host connectivity event on `page` and, when it is a real
    /// transition, tell the controller so every other page hears about it.
    ///
    /// Returns `None` when nothing changed or the controller ignored it.
    pub async fn report_network_status(
        &self,
        page: &mut Page,
        online: bool,
    ) -> Result<Option<usize>, ServiceWorkerError> {
        match page.network_changed(online) {
            Some(message) => self.post_message(page, message.to_value()).await,
            None => Ok(None),
        }
    }

    /// Unregister a scope.
    pub async fn unregister(&self, scope: &str) -> Result<bool, ServiceWorkerError> {
        let removed = self.registrations.write().await.remove(scope);
        match removed {
            Some(mut registration) => {
                registration.unregister().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for ServiceWorkerContainer {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_page_network_changed_only_on_transition() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let mut page = container
            .connect_page(Url::parse("https://dailymeal.app/").unwrap())
            .await;

        assert!(page.is_online());
        assert_eq!(page.network_changed(true), None);
        assert_eq!(
            page.network_changed(false),
            Some(PageMessage::NetworkStatus { online: false })
        );
        assert!(!page.is_online());
        assert_eq!(page.network_changed(false), None);
    }

    #[tokio::test]
    async fn test_post_message_without_controller() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let page = container
            .connect_page(Url::parse("https://dailymeal.app/").unwrap())
            .await;

        let result = container
            .post_message(&page, PageMessage::NetworkStatus { online: false }.to_value())
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_without_registration_passes_through() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let request = dailymeal_net::Request::get(Url::parse("https://dailymeal.app/api/me").unwrap());

        let outcome = container.fetch(FetchEvent::new(request)).await;
        assert!(matches!(outcome, FetchOutcome::Passthrough));
    }
}
