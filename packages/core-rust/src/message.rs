//! The message entity routed by the engine.
//!
//! The engine never interprets `body` itself: it only hands it to operator
//! expressions, rpc clients, and destinations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Property map attached to messages, operators, routings, and client objects.
///
/// Uses `BTreeMap` for deterministic iteration and serialization order.
pub type Properties = BTreeMap<String, String>;

/// Well-known property keys.
pub mod keys {
    /// Identifier assigned by the producer when the sender did not set one.
    pub const MESSAGE_ID: &str = "msgId";
}

/// A message published to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Opaque payload bytes.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    /// User and system properties.
    #[serde(default)]
    pub properties: Properties,
}

impl Message {
    /// Creates a message with no properties.
    #[must_use]
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            properties: Properties::new(),
        }
    }

    /// Builder-style property setter.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns the value of a property, if present.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
