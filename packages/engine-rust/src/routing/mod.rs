//! Operator pipelines and the routing table that manages them.

mod dedup;
pub mod factory;
mod join;
mod ledger;
pub mod operator;
pub mod pipeline;
pub mod rpc;
pub mod table;

pub use factory::{EvaluatorBuilder, OperatorFactory};
pub(crate) use ledger::Ledger;
pub use operator::{CustomEvaluator, Operator, Verdict};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use rpc::{HttpRpcClient, RpcClient, RpcReply};
pub use table::{RouteDecision, RoutingTable};
