//! Install and activate steps.

use dailymeal_net::{Fetcher, Request};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStore};
use crate::handlers::fetch_network;
use crate::{ServiceWorkerError, WorkerConfig};

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl WorkerState {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (_, Redundant)
        ) && self != Redundant
    }
}

/// Populate the static cache with every manifest asset, or with nothing.
///
/// Returns the number of cached assets.
pub async fn install(
    config: &WorkerConfig,
    scope: &Url,
    store: &dyn CacheStore,
    network: &dyn Fetcher,
) -> Result<usize, ServiceWorkerError> {
    let requests = config
        .static_assets
        .iter()
        .map(|asset| {
            scope
                .join(asset)
                .map(Request::get)
                .map_err(|e| ServiceWorkerError::InstallFailed(format!("{asset}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let timeout = config.network_timeout();
    let responses = join_all(requests.iter().map(|request| async move {
        let response = fetch_network(network, request.clone(), timeout).await;
        (request, response)
    }))
    .await;

    let mut entries = Vec::with_capacity(responses.len());
    for (request, result) in responses {
        let response = result.map_err(|e| {
            ServiceWorkerError::InstallFailed(format!("{}: {}", request.url, e))
        })?;
        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{}: status {}",
                request.url, response.status
            )));
        }
        entries.push(CacheEntry::from_response(request, &response));
    }

    let count = entries.len();
    store.put_all(&config.static_cache_name, entries).await?;

    info!(cache = %config.static_cache_name, assets = count, "Static assets cached");
    Ok(count)
}

/// Delete every cache that is not one of the two current generations.
///
/// Returns the deleted cache names.
pub async fn activate(
    config: &WorkerConfig,
    store: &dyn CacheStore,
) -> Result<Vec<String>, ServiceWorkerError> {
    let mut purged = Vec::new();

    for name in store.keys().await? {
        if config.is_current_cache(&name) {
            continue;
        }
        if store.delete(&name).await? {
            debug!(cache = %name, "Deleted stale cache");
            purged.push(name);
        } else {
            warn!(cache = %name, "Stale cache vanished before delete");
        }
    }

    info!(purged = purged.len(), "Stale caches cleaned up");
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(WorkerState::Parsed.can_transition_to(WorkerState::Installing));
        assert!(WorkerState::Installing.can_transition_to(WorkerState::Installed));
        assert!(WorkerState::Installed.can_transition_to(WorkerState::Activating));
        assert!(WorkerState::Activating.can_transition_to(WorkerState::Activated));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!WorkerState::Parsed.can_transition_to(WorkerState::Activated));
        assert!(!WorkerState::Activated.can_transition_to(WorkerState::Installing));
        assert!(!WorkerState::Redundant.can_transition_to(WorkerState::Installing));
        assert!(!WorkerState::Redundant.can_transition_to(WorkerState::Redundant));
    }

    #[test]
    fn test_any_live_state_can_become_redundant() {
        assert!(WorkerState::Installing.can_transition_to(WorkerState::Redundant));
        assert!(WorkerState::Activated.can_transition_to(WorkerState::Redundant));
    }
}
