//! Scalar expressions and conditions

use crate::models::{FieldType, FilterValue};

use super::operation::Select;

/// Literal value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
}

impl From<&FilterValue> for Value {
    fn from(value: &FilterValue) -> Self {
        match value {
            FilterValue::Boolean(b) => Value::Boolean(*b),
            FilterValue::Integer(i) => Value::Integer(*i),
            FilterValue::Float(f) => Value::Float(*f),
            FilterValue::String(s) => Value::String(s.clone()),
        }
    }
}

/// Binary arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
}

/// Sort direction of a window ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Scalar expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column, optionally qualified by a table alias
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    /// `*`, only meaningful inside `COUNT`
    Star,
    /// Function or aggregate call
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    },
    Cast {
        expr: Box<Expr>,
        data_type: FieldType,
    },
    Concat(Vec<Expr>),
    Arithmetic {
        left: Box<Expr>,
        op: ArithmeticOp,
        right: Box<Expr>,
    },
    /// Scalar subquery
    Subquery(Box<Select>),
    /// Ranking window function
    Window {
        function: String,
        partition_by: Vec<Expr>,
        order_by: Vec<(Expr, Order)>,
    },
    /// Textual placeholder substituted after rendering
    Placeholder(String),
}

impl Expr {
    pub fn col(table: &str, name: &str) -> Self {
        Expr::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    pub fn bare(name: &str) -> Self {
        Expr::Column {
            table: None,
            name: name.to_string(),
        }
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Value::Integer(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Value::String(value.into()))
    }

    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    pub fn func(name: &str, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.to_string(),
            args,
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Expr::func("COUNT", vec![Expr::Star])
    }

    pub fn count_distinct(expr: Expr) -> Self {
        Expr::Function {
            name: "COUNT".to_string(),
            args: vec![expr],
            distinct: true,
        }
    }

    pub fn max(expr: Expr) -> Self {
        Expr::func("MAX", vec![expr])
    }

    pub fn min(expr: Expr) -> Self {
        Expr::func("MIN", vec![expr])
    }

    pub fn coalesce(args: Vec<Expr>) -> Self {
        Expr::func("COALESCE", args)
    }

    pub fn cast(expr: Expr, data_type: FieldType) -> Self {
        Expr::Cast {
            expr: Box::new(expr),
            data_type,
        }
    }

    pub fn plus(self, right: Expr) -> Self {
        Expr::Arithmetic {
            left: Box::new(self),
            op: ArithmeticOp::Add,
            right: Box::new(right),
        }
    }

    pub fn minus(self, right: Expr) -> Self {
        Expr::Arithmetic {
            left: Box::new(self),
            op: ArithmeticOp::Subtract,
            right: Box::new(right),
        }
    }

    pub fn subquery(select: Select) -> Self {
        Expr::Subquery(Box::new(select))
    }

    pub fn equals(self, right: Expr) -> Condition {
        Condition::compare(self, CompareOp::Eq, right)
    }

    pub fn not_equals(self, right: Expr) -> Condition {
        Condition::compare(self, CompareOp::Ne, right)
    }

    pub fn gt(self, right: Expr) -> Condition {
        Condition::compare(self, CompareOp::Gt, right)
    }

    pub fn gte(self, right: Expr) -> Condition {
        Condition::compare(self, CompareOp::Gte, right)
    }

    pub fn lt(self, right: Expr) -> Condition {
        Condition::compare(self, CompareOp::Lt, right)
    }

    pub fn lte(self, right: Expr) -> Condition {
        Condition::compare(self, CompareOp::Lte, right)
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

/// Boolean condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        left: Expr,
        op: CompareOp,
        right: Expr,
    },
    IsNull(Expr),
    IsNotNull(Expr),
    In {
        expr: Expr,
        values: Vec<Expr>,
        negated: bool,
    },
    Exists(Box<Select>),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn compare(left: Expr, op: CompareOp, right: Expr) -> Self {
        Condition::Compare { left, op, right }
    }

    pub fn exists(select: Select) -> Self {
        Condition::Exists(Box::new(select))
    }

    pub fn not_exists(select: Select) -> Self {
        Condition::Not(Box::new(Condition::exists(select)))
    }

    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }

    /// Conjunction, flattened; a single condition is returned as is
    pub fn all(conditions: Vec<Condition>) -> Self {
        let mut flat = Vec::new();
        for condition in conditions {
            match condition {
                Condition::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Condition::And(flat)
        }
    }

    /// Disjunction; a single condition is returned as is
    pub fn any(mut conditions: Vec<Condition>) -> Self {
        if conditions.len() == 1 {
            conditions.remove(0)
        } else {
            Condition::Or(conditions)
        }
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::all(vec![self, other])
    }

    /// Equality of the same columns on two aliases
    pub fn columns_match(left: &str, right: &str, columns: &[&str]) -> Self {
        Condition::all(
            columns
                .iter()
                .map(|c| Expr::col(left, c).equals(Expr::col(right, c)))
                .collect(),
        )
    }
}
