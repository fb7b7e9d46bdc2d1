//! Management representation of operators and routings.
//!
//! These are the documents exchanged with the management surface
//! ("create-or-update a named operator/routing"). All structs use
//! `#[serde(rename_all = "camelCase")]` and encode to named `MsgPack` via
//! `rmp_serde::to_vec_named()` or to JSON.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::message::Properties;

// ---------------------------------------------------------------------------
// OperatorKind
// ---------------------------------------------------------------------------

/// Closed set of operator kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorKind {
    /// Keeps messages whose predicate expression is true.
    Filter,
    /// Drops messages whose key was seen within the operator's window.
    Dedup,
    /// Rewrites body and properties with an assignment program.
    #[serde(alias = "expression")]
    Transform,
    /// Merges messages with a correlated message from a second stream.
    Joiner,
    /// Calls an external service and folds the reply into the message.
    Rpc,
    /// Delegates to an evaluator registered by extension code.
    Custom,
}

impl OperatorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorKind::Filter => "filter",
            OperatorKind::Dedup => "dedup",
            OperatorKind::Transform => "transform",
            OperatorKind::Joiner => "joiner",
            OperatorKind::Rpc => "rpc",
            OperatorKind::Custom => "custom",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Validation and encoding failures for management documents.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("{what} name must not be empty")]
    EmptyName { what: &'static str },
    #[error("operator `{operator}` has an empty expression")]
    EmptyExpression { operator: String },
    #[error("operator `{operator}` appears more than once in routing `{routing}`")]
    DuplicateOperator { routing: String, operator: String },
    #[error("routing `{routing}` is missing its {field}")]
    MissingEndpoint { routing: String, field: &'static str },
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// OperatorDef
// ---------------------------------------------------------------------------

/// Named operator definition: kind, expression, and open-ended properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorDef {
    pub name: String,
    pub kind: OperatorKind,
    pub expression: String,
    #[serde(default)]
    pub properties: Properties,
}

impl OperatorDef {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: OperatorKind, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            expression: expression.into(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Checks the structural invariants: non-empty name and expression.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::EmptyName`] or [`DefinitionError::EmptyExpression`].
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName { what: "operator" });
        }
        if self.expression.trim().is_empty() {
            return Err(DefinitionError::EmptyExpression {
                operator: self.name.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RoutingDef
// ---------------------------------------------------------------------------

/// Named routing: source topic, destination queue, and its ordered operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDef {
    pub name: String,
    pub source_topic: String,
    pub destination_queue: String,
    #[serde(default)]
    pub operators: Vec<OperatorDef>,
    #[serde(default)]
    pub properties: Properties,
}

impl RoutingDef {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source_topic: impl Into<String>,
        destination_queue: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_topic: source_topic.into(),
            destination_queue: destination_queue.into(),
            operators: Vec::new(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_operator(mut self, operator: OperatorDef) -> Self {
        self.operators.push(operator);
        self
    }

    /// Validates the routing and every operator it lists.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant, including duplicate operator names.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName { what: "routing" });
        }
        if self.source_topic.trim().is_empty() {
            return Err(DefinitionError::MissingEndpoint {
                routing: self.name.clone(),
                field: "source topic",
            });
        }
        if self.destination_queue.trim().is_empty() {
            return Err(DefinitionError::MissingEndpoint {
                routing: self.name.clone(),
                field: "destination queue",
            });
        }
        let mut seen = HashSet::new();
        for op in &self.operators {
            op.validate()?;
            if !seen.insert(op.name.as_str()) {
                return Err(DefinitionError::DuplicateOperator {
                    routing: self.name.clone(),
                    operator: op.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Encodes as named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::Encode`] if serialization fails.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, DefinitionError> {
        rmp_serde::to_vec_named(self).map_err(|e| DefinitionError::Encode(e.to_string()))
    }

    /// Decodes from `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::Decode`] if the bytes are not a routing document.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, DefinitionError> {
        rmp_serde::from_slice(bytes).map_err(|e| DefinitionError::Decode(e.to_string()))
    }

    /// Encodes as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, DefinitionError> {
        serde_json::to_string_pretty(self).map_err(|e| DefinitionError::Encode(e.to_string()))
    }

    /// Decodes from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::Decode`] if the text is not a routing document.
    pub fn from_json(text: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(text).map_err(|e| DefinitionError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
