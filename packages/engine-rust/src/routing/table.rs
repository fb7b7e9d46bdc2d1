use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::{Message, OperatorDef, RoutingDef};
use tracing::info;

use super::factory::OperatorFactory;
use super::ledger::Ledger;
use super::operator::Operator;
use super::pipeline::{Pipeline, PipelineOutcome};
use crate::error::RoutingError;

/// Outcome of one routing for a routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub routing: String,
    pub outcome: PipelineOutcome,
}

/// Management surface for routings and the operators they share.
///
/// Operators live in a catalog keyed by name; every routing that lists an
/// operator holds the same instance. Updating an operator definition swaps
/// the new instance into every routing that references it. Management calls
/// are serialized; lookups and evaluation are not.
pub struct RoutingTable {
    factory: OperatorFactory,
    operators: DashMap<String, Arc<Operator>>,
    pipelines: DashMap<String, Arc<Pipeline>>,
    write_lock: Mutex<()>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(OperatorFactory::default())
    }
}

impl RoutingTable {
    #[must_use]
    pub fn new(factory: OperatorFactory) -> Self {
        Self {
            factory,
            operators: DashMap::new(),
            pipelines: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Factory used to compile definitions; register rpc clients and custom
    /// evaluators here before referencing them.
    #[must_use]
    pub fn factory(&self) -> &OperatorFactory {
        &self.factory
    }

    /// Creates or replaces the catalog operator named by `def`.
    ///
    /// An identical definition is a no-op that keeps the existing instance
    /// (and its state).
    ///
    /// # Errors
    ///
    /// Returns the factory's error if `def` does not compile.
    pub fn create_or_update_operator(&self, def: OperatorDef) -> Result<Arc<Operator>, RoutingError> {
        let _guard = self.write_lock.lock();
        self.upsert_operator(def)
    }

    fn upsert_operator(&self, def: OperatorDef) -> Result<Arc<Operator>, RoutingError> {
        let existing = self.operators.get(&def.name).map(|e| Arc::clone(e.value()));
        if let Some(existing) = existing {
            if existing.definition() == &def {
                return Ok(existing);
            }
        }
        let operator = Arc::new(self.factory.build(def)?);
        self.operators
            .insert(operator.name().to_string(), Arc::clone(&operator));
        for pipeline in self.all_pipelines() {
            pipeline.replace_operator(Arc::clone(&operator));
        }
        info!(operator = operator.name(), kind = operator.kind().as_str(), "operator updated");
        Ok(operator)
    }

    /// Creates a routing or updates an existing one in place.
    ///
    /// Operators are upserted into the catalog first. When the endpoints
    /// and properties are unchanged the existing pipeline keeps its identity
    /// and only its operator list is swapped.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Definition`] for an invalid definition, or the
    /// first operator compile error. The routing is unchanged on error.
    pub fn create_or_update_routing(&self, def: RoutingDef) -> Result<Arc<Pipeline>, RoutingError> {
        def.validate()?;
        let _guard = self.write_lock.lock();
        // compile everything before touching the catalog
        let mut fresh = Vec::with_capacity(def.operators.len());
        for op in &def.operators {
            let reused = self
                .operators
                .get(&op.name)
                .filter(|e| e.value().definition() == op)
                .map(|e| Arc::clone(e.value()));
            match reused {
                Some(existing) => fresh.push(existing),
                None => fresh.push(Arc::new(self.factory.build(op.clone())?)),
            }
        }
        for operator in &fresh {
            let known = self
                .operators
                .get(operator.name())
                .is_some_and(|e| Arc::ptr_eq(e.value(), operator));
            if !known {
                self.operators
                    .insert(operator.name().to_string(), Arc::clone(operator));
                for pipeline in self.all_pipelines() {
                    pipeline.replace_operator(Arc::clone(operator));
                }
            }
        }

        let existing = self.pipelines.get(&def.name).map(|e| Arc::clone(e.value()));
        if let Some(pipeline) = existing {
            if pipeline.source_topic() == def.source_topic
                && pipeline.destination_queue() == def.destination_queue
                && pipeline.properties() == &def.properties
            {
                pipeline.set_operators(fresh)?;
                info!(routing = %def.name, "routing updated");
                return Ok(pipeline);
            }
        }
        let pipeline = Pipeline::new(&def.name, &def.source_topic, &def.destination_queue)
            .with_properties(def.properties.clone());
        pipeline.set_operators(fresh)?;
        let pipeline = Arc::new(pipeline);
        self.pipelines.insert(def.name.clone(), Arc::clone(&pipeline));
        info!(
            routing = %def.name,
            source = %def.source_topic,
            destination = %def.destination_queue,
            "routing created"
        );
        Ok(pipeline)
    }

    /// Removes a routing. Operators stay in the catalog.
    pub fn delete_routing(&self, name: &str) -> bool {
        let _guard = self.write_lock.lock();
        let removed = self.pipelines.remove(name).is_some();
        if removed {
            info!(routing = name, "routing deleted");
        }
        removed
    }

    /// Removes an operator from the catalog and from every routing.
    pub fn delete_operator(&self, name: &str) -> bool {
        let _guard = self.write_lock.lock();
        let mut removed = self.operators.remove(name).is_some();
        for pipeline in self.all_pipelines() {
            removed |= pipeline.delete_operator(name);
        }
        if removed {
            info!(operator = name, "operator deleted");
        }
        removed
    }

    /// Adds a catalog operator to the end of a routing.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::PipelineNotFound`], [`RoutingError::OperatorNotFound`]
    /// or [`RoutingError::DuplicateOperator`].
    pub fn attach_operator(&self, routing: &str, operator: &str) -> Result<(), RoutingError> {
        let _guard = self.write_lock.lock();
        let pipeline = self.pipeline(routing)?;
        let operator = self.operator(operator)?;
        pipeline.add_operator(operator)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RoutingError::PipelineNotFound`] if no routing has that name.
    pub fn pipeline(&self, name: &str) -> Result<Arc<Pipeline>, RoutingError> {
        self.pipelines
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RoutingError::PipelineNotFound {
                name: name.to_string(),
            })
    }

    /// # Errors
    ///
    /// Returns [`RoutingError::OperatorNotFound`] if the catalog has no such operator.
    pub fn operator(&self, name: &str) -> Result<Arc<Operator>, RoutingError> {
        self.operators
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RoutingError::OperatorNotFound {
                name: name.to_string(),
            })
    }

    /// # Errors
    ///
    /// Returns [`RoutingError::PipelineNotFound`] if no routing has that name.
    pub fn describe(&self, name: &str) -> Result<RoutingDef, RoutingError> {
        Ok(self.pipeline(name)?.to_definition())
    }

    /// Routing names, sorted.
    #[must_use]
    pub fn routings(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Operator catalog names, sorted.
    #[must_use]
    pub fn operator_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Evaluates one named routing.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::PipelineNotFound`] or the pipeline's evaluation error.
    pub async fn evaluate(&self, name: &str, message: Message) -> Result<PipelineOutcome, RoutingError> {
        self.pipeline(name)?.evaluate(message).await
    }

    /// Routings that accept messages on `topic`, sorted by name.
    #[must_use]
    pub fn pipelines_for(&self, topic: &str) -> Vec<Arc<Pipeline>> {
        let mut matched: Vec<Arc<Pipeline>> = self
            .pipelines
            .iter()
            .filter(|e| e.value().accepts(topic))
            .map(|e| Arc::clone(e.value()))
            .collect();
        matched.sort_by(|a, b| a.name().cmp(b.name()));
        matched
    }

    /// Evaluates every routing that accepts `message.topic`.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first evaluation error. Operator state
    /// changed by routings evaluated before the failure is reverted.
    pub async fn route(&self, message: &Message) -> Result<Vec<RouteDecision>, RoutingError> {
        let mut ledger = Ledger::default();
        let decisions = self.route_in(message, &mut ledger).await;
        if decisions.is_err() {
            ledger.rollback();
        }
        decisions
    }

    pub(crate) async fn route_in(
        &self,
        message: &Message,
        ledger: &mut Ledger,
    ) -> Result<Vec<RouteDecision>, RoutingError> {
        let targets = self.pipelines_for(&message.topic);
        let mut decisions = Vec::with_capacity(targets.len());
        for pipeline in targets {
            let outcome = pipeline.evaluate_in(message.clone(), ledger).await?;
            decisions.push(RouteDecision {
                routing: pipeline.name().to_string(),
                outcome,
            });
        }
        Ok(decisions)
    }

    fn all_pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.pipelines.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use relay_core::OperatorKind;

    use super::*;

    fn filter(name: &str, expr: &str) -> OperatorDef {
        OperatorDef::new(name, OperatorKind::Filter, expr)
    }

    #[test]
    fn create_then_describe_round_trips() {
        let table = RoutingTable::default();
        let def = RoutingDef::new("orders", "in.orders", "q.orders")
            .with_operator(filter("eu", "prop.region == 'eu'"))
            .with_operator(OperatorDef::new("d", OperatorKind::Dedup, "prop.id").with_property("window", "4"));
        table.create_or_update_routing(def.clone()).unwrap();
        assert_eq!(table.describe("orders").unwrap(), def);
        assert_eq!(table.routings(), ["orders"]);
        assert_eq!(table.operator_names(), ["d", "eu"]);
    }

    #[test]
    fn update_keeps_pipeline_identity() {
        let table = RoutingTable::default();
        let first = table
            .create_or_update_routing(RoutingDef::new("r", "in", "out").with_operator(filter("a", "true")))
            .unwrap();
        let second = table
            .create_or_update_routing(
                RoutingDef::new("r", "in", "out")
                    .with_operator(filter("a", "true"))
                    .with_operator(filter("b", "true")),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.operators().len(), 2);
    }

    #[test]
    fn shared_operator_update_reaches_every_routing() {
        let table = RoutingTable::default();
        for name in ["r1", "r2"] {
            table
                .create_or_update_routing(RoutingDef::new(name, "in", "out").with_operator(filter("gate", "true")))
                .unwrap();
        }
        let r1 = table.pipeline("r1").unwrap();
        let r2 = table.pipeline("r2").unwrap();
        assert!(Arc::ptr_eq(&r1.operators()[0], &r2.operators()[0]));

        table.create_or_update_operator(filter("gate", "false")).unwrap();
        assert_eq!(r1.operators()[0].expression(), "false");
        assert_eq!(r2.operators()[0].expression(), "false");
    }

    #[test]
    fn identical_operator_update_keeps_instance() {
        let table = RoutingTable::default();
        let a = table.create_or_update_operator(filter("a", "true")).unwrap();
        let b = table.create_or_update_operator(filter("a", "true")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalid_routing_leaves_table_unchanged() {
        let table = RoutingTable::default();
        let bad = RoutingDef::new("r", "in", "out")
            .with_operator(filter("ok", "true"))
            .with_operator(filter("broken", "(("));
        assert!(table.create_or_update_routing(bad).is_err());
        assert!(table.routings().is_empty());
        assert!(table.operator_names().is_empty());
    }

    #[test]
    fn delete_operator_removes_from_routings() {
        let table = RoutingTable::default();
        table
            .create_or_update_routing(
                RoutingDef::new("r", "in", "out")
                    .with_operator(filter("a", "true"))
                    .with_operator(filter("b", "true")),
            )
            .unwrap();
        assert!(table.delete_operator("a"));
        assert!(!table.delete_operator("a"));
        let names: Vec<_> = table
            .pipeline("r")
            .unwrap()
            .operators()
            .iter()
            .map(|op| op.name().to_string())
            .collect();
        assert_eq!(names, ["b"]);
    }

    #[test]
    fn lookups_report_missing_names() {
        let table = RoutingTable::default();
        assert!(matches!(table.pipeline("nope"), Err(RoutingError::PipelineNotFound { .. })));
        assert!(matches!(table.operator("nope"), Err(RoutingError::OperatorNotFound { .. })));
        assert!(!table.delete_routing("nope"));
    }

    #[test]
    fn attach_operator_appends_catalog_entry() {
        let table = RoutingTable::default();
        table.create_or_update_routing(RoutingDef::new("r", "in", "out")).unwrap();
        table.create_or_update_operator(filter("x", "true")).unwrap();
        table.attach_operator("r", "x").unwrap();
        assert!(matches!(
            table.attach_operator("r", "x"),
            Err(RoutingError::DuplicateOperator { .. })
        ));
        assert_eq!(table.describe("r").unwrap().operators.len(), 1);
    }

    #[tokio::test]
    async fn route_visits_matching_routings_in_name_order() {
        let table = RoutingTable::default();
        table
            .create_or_update_routing(RoutingDef::new("b", "in", "qb").with_operator(filter("drop", "false")))
            .unwrap();
        table.create_or_update_routing(RoutingDef::new("a", "in", "qa")).unwrap();
        table.create_or_update_routing(RoutingDef::new("c", "other", "qc")).unwrap();

        let decisions = table.route(&Message::new("in", "x")).await.unwrap();
        let routings: Vec<_> = decisions.iter().map(|d| d.routing.as_str()).collect();
        assert_eq!(routings, ["a", "b"]);
        assert!(matches!(decisions[0].outcome, PipelineOutcome::Forwarded { ref queue, .. } if queue == "qa"));
        assert!(matches!(decisions[1].outcome, PipelineOutcome::Dropped { .. }));
        assert!(table.route(&Message::new("nowhere", "")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_in_a_later_routing_reverts_earlier_dedup() {
        let table = RoutingTable::default();
        table
            .create_or_update_routing(
                RoutingDef::new("a", "in", "qa").with_operator(
                    OperatorDef::new("once", OperatorKind::Dedup, "prop.id").with_property("window", "8"),
                ),
            )
            .unwrap();
        table
            .create_or_update_routing(RoutingDef::new("b", "in", "qb").with_operator(filter("numeric", "int(body) > 0")))
            .unwrap();

        let first = Message::new("in", "x").with_property("id", "1");
        assert!(table.route(&first).await.is_err());
        let retry = Message::new("in", "5").with_property("id", "1");
        let decisions = table.route(&retry).await.unwrap();
        assert!(decisions
            .iter()
            .all(|d| matches!(d.outcome, PipelineOutcome::Forwarded { .. })));
    }
}
