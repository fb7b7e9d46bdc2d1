use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Message, Properties};

use super::batch::BatchProducer;
use super::producer::SendReceipt;
use crate::error::RoutingError;

/// Anything an interceptor can decorate exposes its construction properties.
pub trait Component: Send + Sync {
    fn properties(&self) -> &Properties;
}

/// Entry point that creates producers and consumers.
pub trait AccessPoint: Component {
    fn create_producer(&self) -> Arc<dyn Producer>;

    fn create_consumer(&self, queue: &str) -> Arc<dyn Consumer>;

    /// Batch producers are not decorated by producer interceptors; send
    /// hooks still fire for every message at commit.
    fn create_batch_producer(&self) -> BatchProducer;
}

#[async_trait]
pub trait Producer: Component {
    /// Routes and delivers one message.
    async fn send(&self, message: Message) -> Result<SendReceipt, RoutingError>;
}

#[async_trait]
pub trait Consumer: Component {
    fn queue(&self) -> &str;

    /// Pulls one message and hands it to `listener`. Returns `None` when the
    /// queue is empty, otherwise the listener's result. A failed message is
    /// not redelivered.
    async fn receive(&self, listener: &dyn MessageListener) -> Option<anyhow::Result<()>>;
}

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}
