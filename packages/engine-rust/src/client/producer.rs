use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{keys, Message, Properties};
use tracing::{debug, warn};

use super::promise::Promise;
use super::traits::{Component, Producer};
use crate::error::RoutingError;
use crate::interceptor::{HookDispatcher, SendContext, SendStage};
use crate::queue::Destination;
use crate::routing::{Ledger, PipelineOutcome, RouteDecision, RoutingTable};

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// Where one sent message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A routing forwarded it to `queue`.
    Forwarded { routing: String, queue: String },
    /// A routing's `operator` dropped it.
    Dropped { routing: String, operator: String },
    /// No routing matched; delivered to the topic itself.
    Published { topic: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub topic: String,
    pub deliveries: Vec<Delivery>,
}

impl SendReceipt {
    /// Whether at least one copy reached a queue.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.deliveries
            .iter()
            .any(|d| !matches!(d, Delivery::Dropped { .. }))
    }
}

// ---------------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------------

/// Routing evaluation and delivery, shared by single and batch producers.
#[derive(Clone)]
pub(crate) struct SendPath {
    routing: Arc<RoutingTable>,
    destination: Arc<dyn Destination>,
}

impl SendPath {
    pub(crate) fn new(routing: Arc<RoutingTable>, destination: Arc<dyn Destination>) -> Self {
        Self {
            routing,
            destination,
        }
    }

    /// Assigns a message id unless the sender set one.
    pub(crate) fn stamp(message: &mut Message) -> String {
        message
            .properties
            .entry(keys::MESSAGE_ID.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// Evaluates every matching routing. Operator state changes are
    /// recorded in `ledger` until the caller knows whether the send succeeded.
    pub(crate) async fn evaluate(
        &self,
        message: &Message,
        ledger: &mut Ledger,
    ) -> Result<Vec<RouteDecision>, RoutingError> {
        self.routing.route_in(message, ledger).await
    }

    pub(crate) async fn deliver(
        &self,
        message: Message,
        decisions: Vec<RouteDecision>,
        message_id: String,
    ) -> Result<SendReceipt, RoutingError> {
        let topic = message.topic.clone();
        let mut deliveries = Vec::with_capacity(decisions.len().max(1));
        if decisions.is_empty() {
            self.put(&topic, message).await?;
            deliveries.push(Delivery::Published {
                topic: topic.clone(),
            });
        }
        for decision in decisions {
            match decision.outcome {
                PipelineOutcome::Forwarded { queue, message } => {
                    self.put(&queue, message).await?;
                    deliveries.push(Delivery::Forwarded {
                        routing: decision.routing,
                        queue,
                    });
                }
                PipelineOutcome::Dropped { operator } => deliveries.push(Delivery::Dropped {
                    routing: decision.routing,
                    operator,
                }),
            }
        }
        Ok(SendReceipt {
            message_id,
            topic,
            deliveries,
        })
    }

    async fn put(&self, target: &str, message: Message) -> Result<(), RoutingError> {
        self.destination
            .deliver(target, message)
            .await
            .map_err(|source| RoutingError::Delivery {
                target: target.to_string(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// RoutedProducer
// ---------------------------------------------------------------------------

/// Producer that routes each message through the routing table.
pub struct RoutedProducer {
    properties: Properties,
    path: SendPath,
    hooks: HookDispatcher,
}

impl RoutedProducer {
    pub(crate) fn new(properties: Properties, path: SendPath, hooks: HookDispatcher) -> Self {
        Self {
            properties,
            path,
            hooks,
        }
    }
}

impl Component for RoutedProducer {
    fn properties(&self) -> &Properties {
        &self.properties
    }
}

#[async_trait]
impl Producer for RoutedProducer {
    async fn send(&self, mut message: Message) -> Result<SendReceipt, RoutingError> {
        let message_id = SendPath::stamp(&mut message);
        self.hooks.send_before(&SendContext {
            message: &message,
            producer: &self.properties,
            stage: SendStage::Before,
        });

        let mut ledger = Ledger::default();
        let result = match self.path.evaluate(&message, &mut ledger).await {
            Ok(decisions) => {
                self.path
                    .deliver(message.clone(), decisions, message_id.clone())
                    .await
            }
            Err(err) => Err(err),
        };
        if result.is_err() {
            // the caller may retry; it must not be mistaken for a duplicate
            debug!(message_id = %message_id, changes = ledger.len(), "reverting operator state");
            ledger.rollback();
        }

        let stage = match &result {
            Ok(receipt) => SendStage::Sent(receipt),
            Err(err) => SendStage::Failed(err),
        };
        self.hooks.send_after(&SendContext {
            message: &message,
            producer: &self.properties,
            stage,
        });
        match &result {
            Ok(receipt) => debug!(
                message_id = %message_id,
                topic = %message.topic,
                deliveries = receipt.deliveries.len(),
                "message sent"
            ),
            Err(err) => warn!(message_id = %message_id, topic = %message.topic, error = %err, "send failed"),
        }
        result
    }
}

/// Fire-and-forget sending on top of [`Producer::send`].
pub trait ProducerExt {
    /// Spawns the send on the current tokio runtime and returns a promise
    /// for its outcome. A send that panics fails the promise with
    /// [`RoutingError::SendAborted`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    fn send_async(&self, message: Message) -> Promise<SendReceipt, Arc<RoutingError>>;
}

impl ProducerExt for Arc<dyn Producer> {
    fn send_async(&self, message: Message) -> Promise<SendReceipt, Arc<RoutingError>> {
        let promise = Promise::new();
        let completer = promise.clone();
        let producer = Arc::clone(self);
        tokio::spawn(async move {
            let sending = tokio::spawn(async move { producer.send(message).await });
            match sending.await {
                Ok(Ok(receipt)) => completer.set_success(receipt),
                Ok(Err(err)) => completer.set_failure(Arc::new(err)),
                Err(aborted) => completer.set_failure(Arc::new(RoutingError::SendAborted {
                    reason: aborted.to_string(),
                })),
            };
        });
        promise
    }
}
