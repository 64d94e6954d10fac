//! Dialect-free logical plan
//!
//! Planners build these trees; a sink renders them to SQL text.

pub mod expr;
pub mod operation;

pub use expr::{ArithmeticOp, CompareOp, Condition, Expr, Order, Value};
pub use operation::{
    Alteration, Join, JoinKind, LogicalPlan, Operation, Select, SelectItem, Source,
};

/// Projection item with an alias
pub fn aliased(expr: Expr, alias: &str) -> SelectItem {
    SelectItem {
        expr,
        alias: Some(alias.to_string()),
    }
}
