//! Relay Engine — operator pipelines, routing management and interceptor
//! composition for the relay messaging layer.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod queue;
pub mod routing;

pub use client::{
    AccessPoint, BatchProducer, Component, Consumer, Delivery, MessageListener, Producer,
    ProducerExt, Promise, SendReceipt,
};
pub use config::{EngineConfig, LogConfig};
pub use engine::MessagingEngine;
pub use error::{DeliveryError, RoutingError};
pub use interceptor::{Interceptor, InterceptorId, InterceptorRegistry};
pub use logging::init_tracing;
pub use queue::{Destination, InMemoryQueues, QueueSource};
pub use routing::{Operator, Pipeline, PipelineOutcome, RoutingTable, Verdict};
