use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relay_core::{Message, Properties, RoutingDef};
use tracing::{debug, debug_span, warn, Instrument};

use super::ledger::Ledger;
use super::operator::{Operator, Verdict};
use crate::error::RoutingError;

/// Result of running one pipeline over one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every operator forwarded; `message` is bound for `queue`.
    Forwarded { queue: String, message: Message },
    /// `operator` dropped the message.
    Dropped { operator: String },
}

/// An ordered chain of operators between a source topic and a destination
/// queue.
///
/// The operator list is an immutable snapshot swapped atomically on every
/// mutation. Evaluations load the snapshot once and traverse it without
/// locks, so a traversal never observes a half-applied change. Mutations are
/// serialized among themselves.
pub struct Pipeline {
    name: String,
    source_topic: String,
    destination_queue: String,
    properties: Properties,
    operators: ArcSwap<Vec<Arc<Operator>>>,
    write_lock: Mutex<()>,
}

impl Pipeline {
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
            properties: Properties::new(),
            operators: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source_topic(&self) -> &str {
        &self.source_topic
    }

    #[must_use]
    pub fn destination_queue(&self) -> &str {
        &self.destination_queue
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Appends an operator. Returns `self` for chaining.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateOperator`] if an operator with the
    /// same name is already present; the pipeline is left unchanged.
    pub fn add_operator(&self, operator: impl Into<Arc<Operator>>) -> Result<&Self, RoutingError> {
        let operator = operator.into();
        let _guard = self.write_lock.lock();
        let current = self.operators.load();
        if current.iter().any(|op| op.name() == operator.name()) {
            return Err(RoutingError::DuplicateOperator {
                routing: self.name.clone(),
                operator: operator.name().to_string(),
            });
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(operator);
        self.operators.store(Arc::new(next));
        Ok(self)
    }

    /// Removes the operator named `name`. Returns `false` if none matched.
    pub fn delete_operator(&self, name: &str) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.operators.load();
        let Some(index) = current.iter().position(|op| op.name() == name) else {
            return false;
        };
        let mut next: Vec<_> = current.iter().cloned().collect();
        next.remove(index);
        self.operators.store(Arc::new(next));
        true
    }

    /// Swaps in `operator` at the position of the one with the same name.
    /// Returns `false` if this pipeline has no such operator.
    pub fn replace_operator(&self, operator: Arc<Operator>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.operators.load();
        let Some(index) = current.iter().position(|op| op.name() == operator.name()) else {
            return false;
        };
        let mut next: Vec<_> = current.iter().cloned().collect();
        next[index] = operator;
        self.operators.store(Arc::new(next));
        true
    }

    /// Replaces the whole operator list in one step.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::DuplicateOperator`] if two operators share a
    /// name; the pipeline is left unchanged.
    pub fn set_operators(&self, operators: Vec<Arc<Operator>>) -> Result<(), RoutingError> {
        for (i, op) in operators.iter().enumerate() {
            if operators[..i].iter().any(|prev| prev.name() == op.name()) {
                return Err(RoutingError::DuplicateOperator {
                    routing: self.name.clone(),
                    operator: op.name().to_string(),
                });
            }
        }
        let _guard = self.write_lock.lock();
        self.operators.store(Arc::new(operators));
        Ok(())
    }

    /// Current operator snapshot, in evaluation order.
    #[must_use]
    pub fn operators(&self) -> Arc<Vec<Arc<Operator>>> {
        self.operators.load_full()
    }

    /// Whether messages published to `topic` enter this pipeline.
    #[must_use]
    pub fn accepts(&self, topic: &str) -> bool {
        topic == self.source_topic || self.operators.load().iter().any(|op| op.accepts_topic(topic))
    }

    /// Runs `message` through the operator snapshot current at call time.
    ///
    /// A message from a joiner's right-hand topic skips every other operator
    /// and goes straight to the joiner(s) consuming that topic.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::OperatorEvaluation`] naming the first operator
    /// that failed. Later operators are not run, and state changes made by
    /// earlier ones are reverted.
    pub async fn evaluate(&self, message: Message) -> Result<PipelineOutcome, RoutingError> {
        let mut ledger = Ledger::default();
        let outcome = self.evaluate_in(message, &mut ledger).await;
        if outcome.is_err() {
            ledger.rollback();
        }
        outcome
    }

    /// Like [`evaluate`](Self::evaluate), leaving the rollback decision to
    /// the caller through `ledger`.
    pub(crate) async fn evaluate_in(
        &self,
        message: Message,
        ledger: &mut Ledger,
    ) -> Result<PipelineOutcome, RoutingError> {
        let snapshot = self.operators.load_full();
        let side_stream = message.topic != self.source_topic;
        let topic = message.topic.clone();
        let span = debug_span!(
            "pipeline",
            routing = %self.name,
            topic = %topic,
            side_stream,
            operators = snapshot.len()
        );
        async move {
            let mut message = message;
            let steps = snapshot
                .iter()
                .filter(|op| !side_stream || op.accepts_topic(&topic));
            for op in steps {
                match op.evaluate_in(message, ledger).await {
                    Ok(Verdict::Forward(next)) => message = next,
                    Ok(Verdict::Drop) => {
                        debug!(operator = op.name(), "message dropped");
                        return Ok(PipelineOutcome::Dropped {
                            operator: op.name().to_string(),
                        });
                    }
                    Err(source) => {
                        warn!(operator = op.name(), error = %format!("{source:#}"), "operator failed");
                        return Err(RoutingError::OperatorEvaluation {
                            operator: op.name().to_string(),
                            source,
                        });
                    }
                }
            }
            debug!(queue = %self.destination_queue, "message forwarded");
            Ok(PipelineOutcome::Forwarded {
                queue: self.destination_queue.clone(),
                message,
            })
        }
        .instrument(span)
        .await
    }

    /// Management representation of the current state.
    #[must_use]
    pub fn to_definition(&self) -> RoutingDef {
        RoutingDef {
            name: self.name.clone(),
            source_topic: self.source_topic.clone(),
            destination_queue: self.destination_queue.clone(),
            operators: self
                .operators
                .load()
                .iter()
                .map(|op| op.definition().clone())
                .collect(),
            properties: self.properties.clone(),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .operators
            .load()
            .iter()
            .map(|op| op.name().to_string())
            .collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("source_topic", &self.source_topic)
            .field("destination_queue", &self.destination_queue)
            .field("operators", &names)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use relay_core::{OperatorDef, OperatorKind};

    use super::*;

    fn op(name: &str, kind: OperatorKind, expr: &str) -> Operator {
        Operator::from_def(OperatorDef::new(name, kind, expr)).unwrap()
    }

    fn names(pipeline: &Pipeline) -> Vec<String> {
        pipeline
            .operators()
            .iter()
            .map(|op| op.name().to_string())
            .collect()
    }

    #[test]
    fn add_preserves_order_and_chains() {
        let p = Pipeline::new("r", "in", "out");
        p.add_operator(op("a", OperatorKind::Filter, "true"))
            .unwrap()
            .add_operator(op("b", OperatorKind::Filter, "true"))
            .unwrap();
        assert_eq!(names(&p), ["a", "b"]);
    }

    #[test]
    fn duplicate_name_is_rejected_without_change() {
        let p = Pipeline::new("r", "in", "out");
        p.add_operator(op("a", OperatorKind::Filter, "true")).unwrap();
        let err = p.add_operator(op("a", OperatorKind::Filter, "false")).unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateOperator { ref operator, .. } if operator == "a"));
        assert_eq!(p.operators().len(), 1);
        assert_eq!(p.operators()[0].expression(), "true");
    }

    #[test]
    fn delete_missing_operator_is_noop() {
        let p = Pipeline::new("r", "in", "out");
        p.add_operator(op("a", OperatorKind::Filter, "true")).unwrap();
        assert!(!p.delete_operator("zzz"));
        assert!(p.delete_operator("a"));
        assert!(p.operators().is_empty());
    }

    #[test]
    fn replace_keeps_position() {
        let p = Pipeline::new("r", "in", "out");
        for name in ["a", "b", "c"] {
            p.add_operator(op(name, OperatorKind::Filter, "true")).unwrap();
        }
        assert!(p.replace_operator(Arc::new(op("b", OperatorKind::Filter, "false"))));
        assert_eq!(names(&p), ["a", "b", "c"]);
        assert_eq!(p.operators()[1].expression(), "false");
        assert!(!p.replace_operator(Arc::new(op("x", OperatorKind::Filter, "true"))));
    }

    #[test]
    fn set_operators_rejects_duplicates() {
        let p = Pipeline::new("r", "in", "out");
        let a = Arc::new(op("a", OperatorKind::Filter, "true"));
        assert!(p.set_operators(vec![a.clone(), a]).is_err());
        assert!(p.operators().is_empty());
    }

    #[test]
    fn held_snapshot_is_unaffected_by_mutation() {
        let p = Pipeline::new("r", "in", "out");
        p.add_operator(op("a", OperatorKind::Filter, "true")).unwrap();
        let before = p.operators();
        p.add_operator(op("b", OperatorKind::Filter, "true")).unwrap();
        p.delete_operator("a");
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].name(), "a");
        assert_eq!(names(&p), ["b"]);
    }

    #[tokio::test]
    async fn empty_pipeline_forwards_unchanged() {
        let p = Pipeline::new("r", "in", "out");
        let m = Message::new("in", "x");
        assert_eq!(
            p.evaluate(m.clone()).await.unwrap(),
            PipelineOutcome::Forwarded {
                queue: "out".to_string(),
                message: m
            }
        );
    }

    #[tokio::test]
    async fn first_drop_short_circuits() {
        let p = Pipeline::new("r", "in", "out");
        p.add_operator(op("gate", OperatorKind::Filter, "false")).unwrap();
        // would fail if reached
        p.add_operator(op("boom", OperatorKind::Filter, "int(body) > 0")).unwrap();
        let outcome = p.evaluate(Message::new("in", "x")).await.unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Dropped {
                operator: "gate".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failure_names_the_operator() {
        let p = Pipeline::new("r", "in", "out");
        p.add_operator(op("ok", OperatorKind::Filter, "true")).unwrap();
        p.add_operator(op("boom", OperatorKind::Filter, "int(body) > 0")).unwrap();
        let err = p.evaluate(Message::new("in", "x")).await.unwrap_err();
        assert!(matches!(err, RoutingError::OperatorEvaluation { ref operator, .. } if operator == "boom"));
    }

    #[tokio::test]
    async fn right_topic_skips_operators_before_the_joiner() {
        let p = Pipeline::new("r", "orders", "out");
        p.add_operator(op("eu", OperatorKind::Filter, "prop.region == 'eu'")).unwrap();
        let joiner = Operator::from_def(
            OperatorDef::new("j", OperatorKind::Joiner, "prop.id")
                .with_property("rightTopic", "payments")
                .with_property("timeoutMs", "50"),
        )
        .unwrap();
        p.add_operator(joiner).unwrap();

        let payment = Message::new("payments", "").with_property("id", "1");
        assert_eq!(
            p.evaluate(payment).await.unwrap(),
            PipelineOutcome::Dropped {
                operator: "j".to_string()
            }
        );
        let order = Message::new("orders", "")
            .with_property("id", "1")
            .with_property("region", "eu");
        assert!(matches!(
            p.evaluate(order).await.unwrap(),
            PipelineOutcome::Forwarded { .. }
        ));
    }

    #[tokio::test]
    async fn failed_evaluation_reverts_earlier_operator_state() {
        let p = Pipeline::new("r", "in", "out");
        p.add_operator(
            Operator::from_def(
                OperatorDef::new("once", OperatorKind::Dedup, "prop.id").with_property("window", "8"),
            )
            .unwrap(),
        )
        .unwrap();
        p.add_operator(op("numeric", OperatorKind::Filter, "int(body) > 0")).unwrap();

        let bad = Message::new("in", "x").with_property("id", "7");
        assert!(p.evaluate(bad).await.is_err());
        // the retry is not mistaken for a duplicate
        let retry = Message::new("in", "1").with_property("id", "7");
        assert!(matches!(
            p.evaluate(retry).await.unwrap(),
            PipelineOutcome::Forwarded { .. }
        ));
    }

    #[test]
    fn definition_reflects_operators_and_accepts_right_topic() {
        let p = Pipeline::new("r", "in", "out");
        let joiner = Operator::from_def(
            OperatorDef::new("j", OperatorKind::Joiner, "prop.id").with_property("rightTopic", "side"),
        )
        .unwrap();
        p.add_operator(joiner).unwrap();
        let def = p.to_definition();
        assert_eq!(def.name, "r");
        assert_eq!(def.operators.len(), 1);
        assert_eq!(def.operators[0].name, "j");
        assert!(p.accepts("in"));
        assert!(p.accepts("side"));
        assert!(!p.accepts("other"));
    }
}
