//! Queue seams and the in-process queue store.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::Message;

/// Where forwarded messages go: a routing's destination queue, or the topic
/// itself when no routing matched.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn deliver(&self, target: &str, message: Message) -> anyhow::Result<()>;
}

/// Where consumers pull messages from.
pub trait QueueSource: Send + Sync {
    fn poll(&self, queue: &str) -> Option<Message>;
}

/// FIFO queues held in memory, created on first delivery.
#[derive(Debug, Default)]
pub struct InMemoryQueues {
    queues: DashMap<String, VecDeque<Message>>,
}

impl InMemoryQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, queue: &str, message: Message) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }

    pub fn pop(&self, queue: &str) -> Option<Message> {
        self.queues.get_mut(queue)?.pop_front()
    }

    #[must_use]
    pub fn len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.len())
    }

    #[must_use]
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Copies of the queued messages, oldest first.
    #[must_use]
    pub fn peek_all(&self, queue: &str) -> Vec<Message> {
        self.queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes and returns every queued message.
    pub fn drain(&self, queue: &str) -> Vec<Message> {
        self.queues
            .get_mut(queue)
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Destination for InMemoryQueues {
    async fn deliver(&self, target: &str, message: Message) -> anyhow::Result<()> {
        self.push(target, message);
        Ok(())
    }
}

impl QueueSource for InMemoryQueues {
    fn poll(&self, queue: &str) -> Option<Message> {
        self.pop(queue)
    }
}
