use std::sync::Arc;

use relay_core::Properties;
use tracing::info;

use crate::client::{AccessPoint, DefaultAccessPoint, SendPath};
use crate::config::EngineConfig;
use crate::interceptor::{Composer, HookDispatcher, InterceptorRegistry};
use crate::queue::InMemoryQueues;
use crate::routing::{OperatorFactory, RoutingTable};

/// Wires the routing table, interceptor registry and queue store together
/// and hands out access points.
pub struct MessagingEngine {
    config: EngineConfig,
    interceptors: Arc<InterceptorRegistry>,
    routing: Arc<RoutingTable>,
    queues: Arc<InMemoryQueues>,
}

impl Default for MessagingEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl MessagingEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let routing = Arc::new(RoutingTable::new(OperatorFactory::new(&config)));
        info!(
            node_id = %config.node_id,
            dedup_window = config.dedup_window,
            join_timeout_ms = config.join_timeout_ms,
            rpc_timeout_ms = config.rpc_timeout_ms,
            "messaging engine created"
        );
        Self {
            config,
            interceptors: Arc::new(InterceptorRegistry::new()),
            routing,
            queues: Arc::new(InMemoryQueues::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn interceptors(&self) -> &Arc<InterceptorRegistry> {
        &self.interceptors
    }

    #[must_use]
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    #[must_use]
    pub fn queues(&self) -> &Arc<InMemoryQueues> {
        &self.queues
    }

    /// Builds an access point, decorated by the access point interceptors
    /// registered at this moment. Producers and consumers it creates are
    /// decorated by the interceptors registered when they are created.
    #[must_use]
    pub fn access_point(&self, properties: Properties) -> Arc<dyn AccessPoint> {
        let composer = Composer::new(Arc::clone(&self.interceptors));
        let base = DefaultAccessPoint::new(
            properties,
            SendPath::new(Arc::clone(&self.routing), self.queues.clone()),
            self.queues.clone(),
            composer.clone(),
            HookDispatcher::new(Arc::clone(&self.interceptors)),
        );
        composer.compose_access_point(Arc::new(base))
    }
}
