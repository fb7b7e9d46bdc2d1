//! Interceptor contracts: construction decorators and lifecycle hooks.

use std::sync::Arc;

use relay_core::{Message, Properties};

use crate::client::{Component, SendReceipt};
use crate::error::RoutingError;

/// What a construction interceptor decided.
pub enum Decoration<T: ?Sized> {
    /// Keep the current instance.
    Unchanged,
    /// Use this instance instead; later interceptors see it.
    Replaced(Arc<T>),
}

/// The instance being constructed, as seen by one interceptor in the chain.
pub struct ConstructContext<'a, T: ?Sized> {
    instance: &'a Arc<T>,
}

impl<'a, T: ?Sized + Component> ConstructContext<'a, T> {
    pub(crate) fn new(instance: &'a Arc<T>) -> Self {
        Self { instance }
    }

    /// Current instance: the base, or the previous interceptor's replacement.
    #[must_use]
    pub fn instance(&self) -> &'a Arc<T> {
        self.instance
    }

    #[must_use]
    pub fn properties(&self) -> &'a Properties {
        self.instance.properties()
    }
}

/// Decorates instances of `T` as they are created.
///
/// Errors and panics are contained: the contribution is discarded and the
/// chain continues with the instance as it was.
pub trait ConstructInterceptor<T: ?Sized>: Send + Sync {
    /// # Errors
    ///
    /// Any error discards this interceptor's contribution.
    fn construct(&self, ctx: &ConstructContext<'_, T>) -> anyhow::Result<Decoration<T>>;
}

/// Stage of a send lifecycle event.
#[derive(Debug, Clone, Copy)]
pub enum SendStage<'a> {
    Before,
    Sent(&'a SendReceipt),
    Failed(&'a RoutingError),
}

pub struct SendContext<'a> {
    pub message: &'a Message,
    /// Properties of the producer performing the send.
    pub producer: &'a Properties,
    pub stage: SendStage<'a>,
}

/// Observes sends. Hooks cannot alter the message or the outcome.
pub trait SendInterceptor: Send + Sync {
    /// # Errors
    ///
    /// Errors are logged and ignored.
    fn send_before(&self, _ctx: &SendContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Errors are logged and ignored.
    fn send_after(&self, _ctx: &SendContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Stage of a consume lifecycle event.
#[derive(Debug, Clone, Copy)]
pub enum MessageStage<'a> {
    Before,
    Handled,
    Failed(&'a anyhow::Error),
}

pub struct MessageContext<'a> {
    pub queue: &'a str,
    pub message: &'a Message,
    /// Properties of the consumer receiving the message.
    pub consumer: &'a Properties,
    pub stage: MessageStage<'a>,
}

/// Observes message delivery to listeners.
pub trait MessageInterceptor: Send + Sync {
    /// # Errors
    ///
    /// Errors are logged and ignored.
    fn on_message_before(&self, _ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Errors are logged and ignored.
    fn on_message_after(&self, _ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}
