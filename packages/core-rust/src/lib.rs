//! Relay Core — message model, operator expression language, and routing definitions.

pub mod definition;
pub mod expr;
pub mod message;

pub use definition::{DefinitionError, OperatorDef, OperatorKind, RoutingDef};
pub use expr::{Expr, ExprError, Program, Value};
pub use message::{keys, Message, Properties};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
