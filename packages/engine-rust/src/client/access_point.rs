use std::sync::Arc;

use relay_core::Properties;

use super::batch::BatchProducer;
use super::consumer::QueueConsumer;
use super::producer::{RoutedProducer, SendPath};
use super::traits::{AccessPoint, Component, Consumer, Producer};
use crate::interceptor::{Composer, HookDispatcher};
use crate::queue::QueueSource;

/// Access point that builds routed producers and queue consumers, passing
/// each through the registered construction interceptors.
pub struct DefaultAccessPoint {
    properties: Properties,
    path: SendPath,
    source: Arc<dyn QueueSource>,
    composer: Composer,
    hooks: HookDispatcher,
}

impl DefaultAccessPoint {
    pub(crate) fn new(
        properties: Properties,
        path: SendPath,
        source: Arc<dyn QueueSource>,
        composer: Composer,
        hooks: HookDispatcher,
    ) -> Self {
        Self {
            properties,
            path,
            source,
            composer,
            hooks,
        }
    }
}

impl Component for DefaultAccessPoint {
    fn properties(&self) -> &Properties {
        &self.properties
    }
}

impl AccessPoint for DefaultAccessPoint {
    fn create_producer(&self) -> Arc<dyn Producer> {
        let base = RoutedProducer::new(self.properties.clone(), self.path.clone(), self.hooks.clone());
        self.composer.compose_producer(Arc::new(base))
    }

    fn create_consumer(&self, queue: &str) -> Arc<dyn Consumer> {
        let base = QueueConsumer::new(
            queue,
            self.properties.clone(),
            Arc::clone(&self.source),
            self.hooks.clone(),
        );
        self.composer.compose_consumer(Arc::new(base))
    }

    fn create_batch_producer(&self) -> BatchProducer {
        BatchProducer::new(self.properties.clone(), self.path.clone(), self.hooks.clone())
    }
}
