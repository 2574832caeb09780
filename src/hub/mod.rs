//! The hub process: connection registry, service registry, request
//! tracker, router and the stream endpoint that ties them together.

pub mod connections;
pub mod files;
pub mod handler;
pub mod registry;
pub mod router;
pub mod server;
pub mod subscriptions;
pub mod tracker;

use std::sync::Arc;

use connections::ConnectionManager;
use registry::ServiceRegistry;
use router::Router;
use subscriptions::SubscriptionManager;
use tracker::RequestTracker;

use crate::store::Store;

/// Shared state wired between the hub's components.
pub struct HubState {
    pub connections: Arc<ConnectionManager>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub registry: Arc<ServiceRegistry>,
    pub tracker: Arc<RequestTracker>,
    pub router: Router,
}

impl HubState {
    pub fn new(store: Option<Store>) -> Arc<Self> {
        let connections = Arc::new(ConnectionManager::new());
        let subscriptions = Arc::new(SubscriptionManager::new());
        let registry = Arc::new(ServiceRegistry::new(store));
        let tracker = Arc::new(RequestTracker::new());
        let router = Router::new(
            Arc::clone(&connections),
            Arc::clone(&subscriptions),
            Arc::clone(&registry),
            Arc::clone(&tracker),
        );
        Arc::new(Self {
            connections,
            subscriptions,
            registry,
            tracker,
            router,
        })
    }
}
