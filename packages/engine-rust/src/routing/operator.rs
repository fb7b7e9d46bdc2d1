//! Immutable operator instances and their tagged evaluator dispatch.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Expr, Message, OperatorDef, OperatorKind, Program, Properties};

use super::dedup::Dedup;
use super::factory::OperatorFactory;
use super::join::Joiner;
use super::ledger::Ledger;
use super::rpc::RpcCall;
use crate::error::RoutingError;

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Result of one operator step. Failures are carried by the surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Continue with this (possibly rewritten) message.
    Forward(Message),
    /// Stop the traversal; the message is not forwarded.
    Drop,
}

/// Evaluator supplied by extension code for `custom` operators.
///
/// Implementations may be called concurrently from several pipeline
/// traversals and must synchronize any private state themselves.
#[async_trait]
pub trait CustomEvaluator: Send + Sync {
    async fn evaluate(&self, message: Message) -> anyhow::Result<Verdict>;
}

pub(crate) enum Evaluator {
    Filter(Expr),
    Dedup(Dedup),
    Transform(Program),
    Joiner(Joiner),
    Rpc(RpcCall),
    Custom(Arc<dyn CustomEvaluator>),
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// A named, immutable unit of message processing.
///
/// The definition never changes after construction. Changing an operator
/// means building a new instance and replacing the old one by name.
/// Operator-private state (dedup window, join buffers) belongs to the
/// instance and is discarded with it.
pub struct Operator {
    def: OperatorDef,
    evaluator: Evaluator,
}

impl Operator {
    pub(crate) fn new(def: OperatorDef, evaluator: Evaluator) -> Self {
        Self { def, evaluator }
    }

    /// Builds an operator with the default factory (no registered rpc
    /// clients or custom evaluators).
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::InvalidOperator`] or [`RoutingError::Definition`]
    /// if the definition cannot be compiled.
    pub fn from_def(def: OperatorDef) -> Result<Self, RoutingError> {
        OperatorFactory::default().build(def)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    #[must_use]
    pub fn kind(&self) -> OperatorKind {
        self.def.kind
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        &self.def.expression
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.def.properties
    }

    /// The management representation this operator was built from.
    #[must_use]
    pub fn definition(&self) -> &OperatorDef {
        &self.def
    }

    /// Whether this operator consumes messages from `topic` in addition to the
    /// pipeline's source topic (the right-hand stream of a joiner).
    #[must_use]
    pub fn accepts_topic(&self, topic: &str) -> bool {
        match &self.evaluator {
            Evaluator::Joiner(joiner) => joiner.right_topic() == topic,
            _ => false,
        }
    }

    /// Runs this operator on one message. State changes are kept whatever
    /// the caller does with the verdict.
    ///
    /// # Errors
    ///
    /// Returns the evaluator's failure. The operator itself stays usable.
    pub async fn evaluate(&self, message: Message) -> anyhow::Result<Verdict> {
        self.evaluate_in(message, &mut Ledger::default()).await
    }

    /// Like [`evaluate`](Self::evaluate), recording how to revert state
    /// changes in `ledger`.
    pub(crate) async fn evaluate_in(&self, message: Message, ledger: &mut Ledger) -> anyhow::Result<Verdict> {
        match &self.evaluator {
            Evaluator::Filter(predicate) => Ok(if predicate.matches(&message)? {
                Verdict::Forward(message)
            } else {
                Verdict::Drop
            }),
            Evaluator::Dedup(dedup) => Ok(dedup.evaluate(message, ledger)?),
            Evaluator::Transform(program) => {
                let mut message = message;
                program.apply(&mut message)?;
                Ok(Verdict::Forward(message))
            }
            Evaluator::Joiner(joiner) => joiner.evaluate(message, ledger).await,
            Evaluator::Rpc(call) => call.evaluate(message).await,
            Evaluator::Custom(custom) => custom.evaluate(message).await,
        }
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.def.name)
            .field("kind", &self.def.kind)
            .field("expression", &self.def.expression)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str, kind: OperatorKind, expr: &str) -> Operator {
        Operator::from_def(OperatorDef::new(name, kind, expr)).unwrap()
    }

    #[tokio::test]
    async fn filter_keeps_true_and_drops_false() {
        let filter = op("eu", OperatorKind::Filter, "prop.region == 'eu'");
        let eu = Message::new("t", "x").with_property("region", "eu");
        let us = Message::new("t", "x").with_property("region", "us");
        assert_eq!(
            filter.evaluate(eu.clone()).await.unwrap(),
            Verdict::Forward(eu)
        );
        assert_eq!(filter.evaluate(us).await.unwrap(), Verdict::Drop);
        // missing property evaluates to null, which drops
        assert_eq!(
            filter.evaluate(Message::new("t", "x")).await.unwrap(),
            Verdict::Drop
        );
    }

    #[tokio::test]
    async fn transform_rewrites_message() {
        let transform = op("up", OperatorKind::Transform, "body = upper(body); prop.done = 'y'");
        let Verdict::Forward(out) = transform.evaluate(Message::new("t", "abc")).await.unwrap()
        else {
            panic!("transform must forward");
        };
        assert_eq!(out.body, b"ABC");
        assert_eq!(out.property("done"), Some("y"));
    }

    #[tokio::test]
    async fn evaluation_error_leaves_operator_usable() {
        let filter = op("num", OperatorKind::Filter, "prop.n % 2 == 0");
        let bad = Message::new("t", "").with_property("n", "abc");
        assert!(filter.evaluate(bad).await.is_err());
        let good = Message::new("t", "").with_property("n", "4");
        assert!(matches!(
            filter.evaluate(good).await.unwrap(),
            Verdict::Forward(_)
        ));
    }

    #[test]
    fn invalid_expression_is_rejected_at_construction() {
        let err = Operator::from_def(OperatorDef::new("bad", OperatorKind::Filter, "prop.")).unwrap_err();
        assert!(matches!(err, RoutingError::InvalidOperator { ref name, .. } if name == "bad"));

        let err = Operator::from_def(OperatorDef::new("empty", OperatorKind::Filter, "")).unwrap_err();
        assert!(matches!(err, RoutingError::Definition(_)));
    }

    #[test]
    fn accessors_expose_definition() {
        let def = OperatorDef::new("f", OperatorKind::Filter, "true").with_property("k", "v");
        let operator = Operator::from_def(def.clone()).unwrap();
        assert_eq!(operator.name(), "f");
        assert_eq!(operator.kind(), OperatorKind::Filter);
        assert_eq!(operator.expression(), "true");
        assert_eq!(operator.properties().get("k").map(String::as_str), Some("v"));
        assert_eq!(operator.definition(), &def);
        assert!(!operator.accepts_topic("anything"));
        assert!(format!("{operator:?}").contains("\"f\""));
    }
}
