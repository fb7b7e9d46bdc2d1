use std::sync::Arc;

use async_trait::async_trait;
use relay_core::Properties;
use tracing::{debug, warn};

use super::traits::{Component, Consumer, MessageListener};
use crate::interceptor::{HookDispatcher, MessageContext, MessageStage};
use crate::queue::QueueSource;

/// Consumer that pulls from one queue of a [`QueueSource`].
pub struct QueueConsumer {
    queue: String,
    properties: Properties,
    source: Arc<dyn QueueSource>,
    hooks: HookDispatcher,
}

impl QueueConsumer {
    pub(crate) fn new(
        queue: impl Into<String>,
        properties: Properties,
        source: Arc<dyn QueueSource>,
        hooks: HookDispatcher,
    ) -> Self {
        Self {
            queue: queue.into(),
            properties,
            source,
            hooks,
        }
    }
}

impl Component for QueueConsumer {
    fn properties(&self) -> &Properties {
        &self.properties
    }
}

#[async_trait]
impl Consumer for QueueConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, listener: &dyn MessageListener) -> Option<anyhow::Result<()>> {
        let message = self.source.poll(&self.queue)?;
        self.hooks.on_message_before(&MessageContext {
            queue: &self.queue,
            message: &message,
            consumer: &self.properties,
            stage: MessageStage::Before,
        });

        let result = listener.on_message(&message).await;

        let stage = match &result {
            Ok(()) => MessageStage::Handled,
            Err(err) => MessageStage::Failed(err),
        };
        self.hooks.on_message_after(&MessageContext {
            queue: &self.queue,
            message: &message,
            consumer: &self.properties,
            stage,
        });
        match &result {
            Ok(()) => debug!(queue = %self.queue, "message handled"),
            Err(err) => warn!(queue = %self.queue, error = %format!("{err:#}"), "listener failed"),
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use relay_core::Message;

    use super::*;
    use crate::interceptor::{Interceptor, InterceptorRegistry, MessageInterceptor};
    use crate::queue::InMemoryQueues;

    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl MessageListener for Collect {
        async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
            if message.body == b"bad" {
                anyhow::bail!("rejected");
            }
            self.0.lock().push(message.body_lossy());
            Ok(())
        }
    }

    struct Stages(Arc<Mutex<Vec<&'static str>>>);

    impl MessageInterceptor for Stages {
        fn on_message_before(&self, _ctx: &MessageContext<'_>) -> anyhow::Result<()> {
            self.0.lock().push("before");
            Ok(())
        }

        fn on_message_after(&self, ctx: &MessageContext<'_>) -> anyhow::Result<()> {
            self.0.lock().push(match ctx.stage {
                MessageStage::Failed(_) => "failed",
                _ => "handled",
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn receive_runs_listener_between_hooks() {
        let queues = Arc::new(InMemoryQueues::new());
        queues.push("q", Message::new("t", "ok"));
        queues.push("q", Message::new("t", "bad"));
        let registry = Arc::new(InterceptorRegistry::new());
        let stages = Arc::new(Mutex::new(Vec::new()));
        registry.register("stages", Interceptor::OnMessage(Arc::new(Stages(Arc::clone(&stages)))));
        let consumer = QueueConsumer::new("q", Properties::new(), queues.clone(), HookDispatcher::new(registry));
        let listener = Collect(Mutex::new(Vec::new()));

        assert!(consumer.receive(&listener).await.unwrap().is_ok());
        assert!(consumer.receive(&listener).await.unwrap().is_err());
        assert!(consumer.receive(&listener).await.is_none());

        assert_eq!(*listener.0.lock(), ["ok"]);
        assert_eq!(*stages.lock(), ["before", "handled", "before", "failed"]);
        // failed messages are not requeued
        assert!(queues.is_empty("q"));
    }
}
