//! # DailyMeal Service Worker
//!
//! The offline layer of the DailyMeal web app. It sits between pages and the
//! network and decides, per request, whether to answer from the network, from
//! a cache, or with a synthesized offline reply.
//!
//! ## Features
//!
//! - **Lifecycle**: install (static asset precache), activate (stale cache purge)
//! - **Routing**: realtime passthrough, network-first API/uploads, cache-first rest
//! - **Offline replies**: `503` JSON for API calls, app shell for navigations
//! - **Status relay**: online/offline transitions rebroadcast to every other page
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (page bootstrap)
//!     │
//!     └── Registration
//!             ├── installing / waiting / active (ServiceWorker)
//!             │       ├── Router ──→ FetchHandlers (network-first | cache-first)
//!             │       └── dispatch(WorkerEvent)
//!             └── Clients (open pages)
//!
//! CacheStore
//!     ├── dailymeal-static-v1   (install manifest)
//!     └── dailymeal-api-v1      (last good API responses)
//! ```

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod message;
pub mod router;
pub mod worker;

pub use cache::{
    Cache, CacheEntry, CacheKey, CacheStorage, CacheStore, MemoryCacheStore, PersistentCacheStore,
};
pub use clients::{Client, ClientId, Clients};
pub use config::WorkerConfig;
pub use container::{ContainerEvent, Page, Registration, ServiceWorkerContainer};
pub use error::ServiceWorkerError;
pub use handlers::{FetchHandlers, FetchResponse, ResponseSource};
pub use lifecycle::WorkerState;
pub use message::{PageMessage, WorkerMessage};
pub use router::{RoutePolicy, Router};
pub use worker::{
    EventOutcome, FetchEvent, FetchOutcome, ServiceWorker, ServiceWorkerId, WorkerEvent,
};
