use std::mem;

use parking_lot::Mutex;
use relay_core::{Message, Properties};
use tracing::{debug, warn};

use super::producer::{SendPath, SendReceipt};
use crate::error::RoutingError;
use crate::interceptor::{HookDispatcher, SendContext, SendStage};
use crate::routing::Ledger;

/// Buffers messages and sends them together on [`commit`](Self::commit).
///
/// Commit evaluates every buffered message before delivering any of them,
/// so an evaluation failure anywhere leaves every queue untouched and
/// reverts operator state (dedup windows, join buffers) touched by the
/// batch. A delivery failure after evaluation may leave earlier messages
/// delivered; state for the failed message and those after it is reverted.
///
/// Messages are evaluated one at a time in buffer order. A joiner can pair
/// a right-hand message with a later left-hand one in the same batch, but a
/// left-hand message placed before its partner waits out the join timeout
/// and fails the commit.
pub struct BatchProducer {
    properties: Properties,
    path: SendPath,
    hooks: HookDispatcher,
    pending: Mutex<Vec<Message>>,
}

impl BatchProducer {
    pub(crate) fn new(properties: Properties, path: SendPath, hooks: HookDispatcher) -> Self {
        Self {
            properties,
            path,
            hooks,
            pending: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Buffers a message. Returns the number of buffered messages.
    pub fn send(&self, message: Message) -> usize {
        let mut pending = self.pending.lock();
        pending.push(message);
        pending.len()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Discards buffered messages. Returns how many were discarded.
    pub fn rollback(&self) -> usize {
        let discarded = mem::take(&mut *self.pending.lock()).len();
        debug!(discarded, "batch rolled back");
        discarded
    }

    /// Sends every buffered message, in buffer order.
    ///
    /// # Errors
    ///
    /// Returns the first evaluation error (nothing delivered) or the first
    /// delivery error. The buffer is emptied either way.
    pub async fn commit(&self) -> Result<Vec<SendReceipt>, RoutingError> {
        let batch = mem::take(&mut *self.pending.lock());
        let mut staged = Vec::with_capacity(batch.len());
        for mut message in batch {
            let id = SendPath::stamp(&mut message);
            self.hooks.send_before(&SendContext {
                message: &message,
                producer: &self.properties,
                stage: SendStage::Before,
            });
            staged.push((id, message));
        }

        let mut evaluated = Vec::with_capacity(staged.len());
        let mut ledgers = Vec::with_capacity(staged.len());
        for (_, message) in &staged {
            let mut ledger = Ledger::default();
            match self.path.evaluate(message, &mut ledger).await {
                Ok(decisions) => {
                    evaluated.push(decisions);
                    ledgers.push(ledger);
                }
                Err(err) => {
                    ledgers.push(ledger);
                    revert(ledgers);
                    self.fail_all(&staged, &err);
                    warn!(size = staged.len(), error = %err, "batch aborted during evaluation");
                    return Err(err);
                }
            }
        }

        let mut receipts = Vec::with_capacity(staged.len());
        let size = staged.len();
        let mut remaining = staged.into_iter().zip(evaluated).zip(ledgers);
        while let Some((((id, message), decisions), ledger)) = remaining.next() {
            let result = self.path.deliver(message.clone(), decisions, id).await;
            let stage = match &result {
                Ok(receipt) => SendStage::Sent(receipt),
                Err(err) => SendStage::Failed(err),
            };
            self.hooks.send_after(&SendContext {
                message: &message,
                producer: &self.properties,
                stage,
            });
            match result {
                Ok(receipt) => receipts.push(receipt),
                Err(err) => {
                    let mut undelivered = vec![ledger];
                    for (((_, later), _), later_ledger) in remaining.by_ref() {
                        self.hooks.send_after(&SendContext {
                            message: &later,
                            producer: &self.properties,
                            stage: SendStage::Failed(&err),
                        });
                        undelivered.push(later_ledger);
                    }
                    revert(undelivered);
                    warn!(delivered = receipts.len(), size, error = %err, "batch delivery failed");
                    return Err(err);
                }
            }
        }
        debug!(size, "batch committed");
        Ok(receipts)
    }

    fn fail_all(&self, staged: &[(String, Message)], err: &RoutingError) {
        for (_, message) in staged {
            self.hooks.send_after(&SendContext {
                message,
                producer: &self.properties,
                stage: SendStage::Failed(err),
            });
        }
    }
}

/// Reverts the state recorded for a run of messages, newest change first.
fn revert(ledgers: Vec<Ledger>) {
    let mut combined = Ledger::default();
    for ledger in ledgers {
        combined.absorb(ledger);
    }
    debug!(changes = combined.len(), "reverting batch operator state");
    combined.rollback();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relay_core::{OperatorDef, OperatorKind, RoutingDef};

    use super::*;
    use crate::interceptor::InterceptorRegistry;
    use crate::queue::InMemoryQueues;
    use crate::routing::RoutingTable;

    fn batch(queues: &Arc<InMemoryQueues>) -> BatchProducer {
        let table = Arc::new(RoutingTable::default());
        table
            .create_or_update_routing(
                RoutingDef::new("r", "in", "out").with_operator(OperatorDef::new(
                    "positive",
                    OperatorKind::Filter,
                    "int(body) > 0",
                )),
            )
            .unwrap();
        BatchProducer::new(
            Properties::new(),
            SendPath::new(table, Arc::clone(queues) as Arc<dyn crate::queue::Destination>),
            HookDispatcher::new(Arc::new(InterceptorRegistry::new())),
        )
    }

    #[tokio::test]
    async fn commit_delivers_in_order() {
        let queues = Arc::new(InMemoryQueues::new());
        let b = batch(&queues);
        assert_eq!(b.send(Message::new("in", "1")), 1);
        assert_eq!(b.send(Message::new("in", "-1")), 2);
        assert_eq!(b.send(Message::new("in", "3")), 3);
        let receipts = b.commit().await.unwrap();
        assert_eq!(receipts.len(), 3);
        assert!(!receipts[1].is_delivered());
        let bodies: Vec<_> = queues.drain("out").into_iter().map(|m| m.body_lossy()).collect();
        assert_eq!(bodies, ["1", "3"]);
        assert_eq!(b.pending(), 0);
    }

    #[tokio::test]
    async fn evaluation_failure_delivers_nothing() {
        let queues = Arc::new(InMemoryQueues::new());
        let b = batch(&queues);
        b.send(Message::new("in", "1"));
        b.send(Message::new("in", "not-a-number"));
        assert!(b.commit().await.is_err());
        assert!(queues.is_empty("out"));
        assert_eq!(b.pending(), 0);
    }

    #[tokio::test]
    async fn failed_commit_reverts_dedup_state() {
        let table = Arc::new(RoutingTable::default());
        table
            .create_or_update_routing(
                RoutingDef::new("r", "in", "out")
                    .with_operator(
                        OperatorDef::new("once", OperatorKind::Dedup, "body").with_property("window", "8"),
                    )
                    .with_operator(OperatorDef::new("numeric", OperatorKind::Filter, "int(body) > 0")),
            )
            .unwrap();
        let queues = Arc::new(InMemoryQueues::new());
        let b = BatchProducer::new(
            Properties::new(),
            SendPath::new(table, Arc::clone(&queues) as Arc<dyn crate::queue::Destination>),
            HookDispatcher::new(Arc::new(InterceptorRegistry::new())),
        );

        b.send(Message::new("in", "1"));
        b.send(Message::new("in", "bad"));
        assert!(b.commit().await.is_err());

        b.send(Message::new("in", "1"));
        let receipts = b.commit().await.unwrap();
        assert!(receipts[0].is_delivered());
        assert_eq!(queues.len("out"), 1);
    }

    #[test]
    fn rollback_discards_buffer() {
        let queues = Arc::new(InMemoryQueues::new());
        let b = batch(&queues);
        b.send(Message::new("in", "1"));
        b.send(Message::new("in", "2"));
        assert_eq!(b.rollback(), 2);
        assert_eq!(b.pending(), 0);
    }
}
