//! Producer, consumer and access point surface.

mod access_point;
mod batch;
mod consumer;
mod producer;
mod promise;
mod traits;

pub use access_point::DefaultAccessPoint;
pub use batch::BatchProducer;
pub use consumer::QueueConsumer;
pub use producer::{Delivery, ProducerExt, RoutedProducer, SendReceipt};
pub(crate) use producer::SendPath;
pub use promise::Promise;
pub use traits::{AccessPoint, Component, Consumer, MessageListener, Producer};
