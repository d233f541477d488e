//! Request classification.

use url::Url;

use crate::WorkerConfig;

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
    /// Not intercepted; goes to the network untouched.
    Passthrough,
    /// Network, then API cache, then a synthesized offline reply.
    NetworkFirst,
    /// Any cache, then network, then shell or 404.
    CacheFirst,
}

/// Classifies requests by URL path. Pure and stateless.
#[derive(Debug, Clone)]
pub struct Router {
    realtime_marker: String,
    network_first_prefixes: [String; 2],
}

impl Router {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            realtime_marker: config.realtime_marker.clone(),
            network_first_prefixes: [config.api_prefix.clone(), config.upload_prefix.clone()],
        }
    }

    pub fn classify(&self, url: &Url) -> RoutePolicy {
        let path = url.path();

        // Socket handshakes and long-polls must never be cached or replayed.
        if path.contains(&self.realtime_marker) {
            return RoutePolicy::Passthrough;
        }

        if self
            .network_first_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return RoutePolicy::NetworkFirst;
        }

        RoutePolicy::CacheFirst
    }
}
