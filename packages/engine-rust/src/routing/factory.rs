use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use relay_core::{Expr, OperatorDef, OperatorKind, Program};

use super::dedup::Dedup;
use super::join::{JoinBody, Joiner};
use super::operator::{CustomEvaluator, Evaluator, Operator};
use super::rpc::{HttpRpcClient, RpcCall, RpcClient};
use crate::config::EngineConfig;
use crate::error::RoutingError;

/// Operator property names understood by the built-in kinds.
pub mod props {
    pub const WINDOW: &str = "window";
    pub const TTL_MS: &str = "ttlMs";
    pub const RIGHT_TOPIC: &str = "rightTopic";
    pub const TIMEOUT_MS: &str = "timeoutMs";
    pub const BUFFER_SIZE: &str = "bufferSize";
    pub const BODY: &str = "body";
    pub const RESPONSE_PROPERTY: &str = "responseProperty";
    pub const EVALUATOR: &str = "evaluator";
}

/// Builds a custom evaluator from an operator definition.
pub type EvaluatorBuilder =
    Arc<dyn Fn(&OperatorDef) -> anyhow::Result<Arc<dyn CustomEvaluator>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Defaults {
    dedup_window: usize,
    join_timeout_ms: u64,
    join_buffer_size: usize,
    rpc_timeout_ms: u64,
}

/// Compiles [`OperatorDef`]s into [`Operator`]s.
///
/// Holds the engine-level defaults, the rpc transports keyed by endpoint and
/// the custom evaluator builders keyed by name. Registrations are shared
/// between clones.
#[derive(Clone)]
pub struct OperatorFactory {
    defaults: Defaults,
    rpc_clients: Arc<DashMap<String, Arc<dyn RpcClient>>>,
    evaluators: Arc<DashMap<String, EvaluatorBuilder>>,
    http: Arc<OnceLock<Arc<dyn RpcClient>>>,
}

impl Default for OperatorFactory {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl OperatorFactory {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            defaults: Defaults {
                dedup_window: config.dedup_window,
                join_timeout_ms: config.join_timeout_ms,
                join_buffer_size: config.join_buffer_size,
                rpc_timeout_ms: config.rpc_timeout_ms,
            },
            rpc_clients: Arc::new(DashMap::new()),
            evaluators: Arc::new(DashMap::new()),
            http: Arc::new(OnceLock::new()),
        }
    }

    /// Routes `rpc` operators whose expression is `endpoint` to `client`.
    /// Endpoints starting with `http://` or `https://` fall back to HTTP.
    pub fn register_rpc_client(&self, endpoint: impl Into<String>, client: Arc<dyn RpcClient>) {
        self.rpc_clients.insert(endpoint.into(), client);
    }

    /// Makes `name` available to `custom` operators via their `evaluator` property.
    pub fn register_evaluator<F>(&self, name: impl Into<String>, builder: F)
    where
        F: Fn(&OperatorDef) -> anyhow::Result<Arc<dyn CustomEvaluator>> + Send + Sync + 'static,
    {
        self.evaluators.insert(name.into(), Arc::new(builder));
    }

    /// Validates `def` and compiles it.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Definition`] for structural problems and
    /// [`RoutingError::InvalidOperator`] when the expression or a property
    /// cannot be compiled.
    pub fn build(&self, def: OperatorDef) -> Result<Operator, RoutingError> {
        def.validate()?;
        let evaluator = match def.kind {
            OperatorKind::Filter => Evaluator::Filter(compile(&def)?),
            OperatorKind::Transform => Evaluator::Transform(
                Program::parse(&def.expression)
                    .map_err(|e| RoutingError::invalid_expression(&def.name, &e))?,
            ),
            OperatorKind::Dedup => {
                let window = property(&def, props::WINDOW)?.unwrap_or(self.defaults.dedup_window);
                if window == 0 {
                    return Err(invalid(&def, "`window` must be at least 1"));
                }
                let ttl = property::<u64>(&def, props::TTL_MS)?.map(Duration::from_millis);
                Evaluator::Dedup(Dedup::new(compile(&def)?, window, ttl))
            }
            OperatorKind::Joiner => self.joiner(&def)?,
            OperatorKind::Rpc => self.rpc(&def)?,
            OperatorKind::Custom => self.custom(&def)?,
        };
        Ok(Operator::new(def, evaluator))
    }

    fn joiner(&self, def: &OperatorDef) -> Result<Evaluator, RoutingError> {
        let right_topic = def
            .properties
            .get(props::RIGHT_TOPIC)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| invalid(def, "missing `rightTopic` property"))?
            .clone();
        let timeout = property(def, props::TIMEOUT_MS)?.unwrap_or(self.defaults.join_timeout_ms);
        let capacity =
            property(def, props::BUFFER_SIZE)?.unwrap_or(self.defaults.join_buffer_size);
        let body = match def.properties.get(props::BODY) {
            None => JoinBody::Left,
            Some(text) => JoinBody::parse(text)
                .ok_or_else(|| invalid(def, "`body` must be left, right or concat"))?,
        };
        Ok(Evaluator::Joiner(Joiner::new(
            compile(def)?,
            right_topic,
            Duration::from_millis(timeout),
            capacity.max(1),
            body,
        )))
    }

    fn rpc(&self, def: &OperatorDef) -> Result<Evaluator, RoutingError> {
        let endpoint = def.expression.trim().to_string();
        let client = match self.rpc_clients.get(&endpoint) {
            Some(client) => Arc::clone(client.value()),
            None if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {
                Arc::clone(self.http.get_or_init(|| Arc::new(HttpRpcClient::default())))
            }
            None => return Err(invalid(def, "no rpc client registered for endpoint")),
        };
        let timeout = property(def, props::TIMEOUT_MS)?.unwrap_or(self.defaults.rpc_timeout_ms);
        Ok(Evaluator::Rpc(RpcCall::new(
            endpoint,
            client,
            Duration::from_millis(timeout),
            def.properties.get(props::RESPONSE_PROPERTY).cloned(),
        )))
    }

    fn custom(&self, def: &OperatorDef) -> Result<Evaluator, RoutingError> {
        let name = def
            .properties
            .get(props::EVALUATOR)
            .ok_or_else(|| invalid(def, "missing `evaluator` property"))?;
        let builder = self
            .evaluators
            .get(name)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| invalid(def, &format!("unknown evaluator `{name}`")))?;
        let evaluator = builder(def).map_err(|e| invalid(def, &format!("{e:#}")))?;
        Ok(Evaluator::Custom(evaluator))
    }
}

fn compile(def: &OperatorDef) -> Result<Expr, RoutingError> {
    Expr::parse(&def.expression).map_err(|e| RoutingError::invalid_expression(&def.name, &e))
}

fn invalid(def: &OperatorDef, reason: &str) -> RoutingError {
    RoutingError::InvalidOperator {
        name: def.name.clone(),
        reason: reason.to_string(),
    }
}

fn property<T: FromStr>(def: &OperatorDef, key: &str) -> Result<Option<T>, RoutingError> {
    def.properties
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| invalid(def, &format!("`{key}` has invalid value `{raw}`")))
        })
        .transpose()
}
