//! # Query Proxy Engine
//!
//! Captures chained query operations as immutable expression values instead
//! of executing them. A chain is realized into a portable IR context only
//! when it is consumed through [`QueryBuilder::run`], [`QueryBuilder::cursor`],
//! or a change feed; until then nothing crosses the process boundary.
//!
//! Expressions are category-typed: a [`BoolExpr`] only offers boolean
//! operations, a [`NumExpr`] arithmetic and ordering, and so on. Dynamic
//! entry points such as object indexing yield an untyped [`Expr`] that can be
//! narrowed with the `try_*` casts, which fail immediately with a type
//! mismatch rather than at execution time.

mod builder;
mod expr;

pub use builder::{Conflict, Direction, QueryBuilder};
pub use expr::{
    ArrayExpr, BoolExpr, DateExpr, Expr, NumExpr, ObjExpr, RowCapture, StrExpr,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Capability category tracked for every expression node.
///
/// `Any` marks values whose category is unknown until execution, such as the
/// result of indexing into an object. Casting from `Any` always succeeds at
/// build time; casting between two concrete categories fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Any,
    Bool,
    Num,
    Str,
    Date,
    Array,
    Object,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Any => "any",
            Category::Bool => "bool",
            Category::Num => "number",
            Category::Str => "string",
            Category::Date => "date",
            Category::Array => "array",
            Category::Object => "object",
        };
        write!(f, "{}", name)
    }
}

impl Category {
    /// Category of a literal JSON value. Nulls stay `Any` since they carry
    /// no capability information.
    pub fn of_value(value: &serde_json::Value) -> Category {
        match value {
            serde_json::Value::Null => Category::Any,
            serde_json::Value::Bool(_) => Category::Bool,
            serde_json::Value::Number(_) => Category::Num,
            serde_json::Value::String(_) => Category::Str,
            serde_json::Value::Array(_) => Category::Array,
            serde_json::Value::Object(_) => Category::Object,
        }
    }
}

/// Errors raised while building query expressions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    /// An operation or cast was applied to an expression of the wrong category.
    #[error("type mismatch: expected {expected} expression, found {actual}")]
    TypeMismatch {
        expected: Category,
        actual: Category,
    },

    /// A comparison operator was applied to a category that does not order.
    #[error("operator '{op}' is not supported for {category} expressions")]
    UnsupportedOperator { op: CompareOp, category: Category },

    /// A filter comparison operator name could not be parsed.
    #[error("unknown comparison operator: {0}")]
    UnknownOperator(String),
}

/// Result type alias for expression building
pub type ExprResult<T> = Result<T, ExprError>;

/// Comparison operators accepted by dynamic filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Match,
}

static COMPARE_OPS: Lazy<BTreeMap<&'static str, CompareOp>> = Lazy::new(|| {
    let mut ops = BTreeMap::new();
    ops.insert("eq", CompareOp::Eq);
    ops.insert("ne", CompareOp::Ne);
    ops.insert("lt", CompareOp::Lt);
    ops.insert("le", CompareOp::Le);
    ops.insert("lte", CompareOp::Le);
    ops.insert("gt", CompareOp::Gt);
    ops.insert("ge", CompareOp::Ge);
    ops.insert("gte", CompareOp::Ge);
    ops.insert("contains", CompareOp::Contains);
    ops.insert("match", CompareOp::Match);
    ops
});

impl CompareOp {
    /// Step id used for this operator in the IR.
    pub fn step_id(&self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Contains => "contains",
            CompareOp::Match => "match",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.step_id())
    }
}

impl std::str::FromStr for CompareOp {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        COMPARE_OPS
            .get(s)
            .copied()
            .ok_or_else(|| ExprError::UnknownOperator(s.to_string()))
    }
}
