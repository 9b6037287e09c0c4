//! # Query Intermediate Representation
//!
//! Portable, engine-agnostic encoding of a captured query. A query is an
//! ordered list of steps; each step applies an operation to the output of the
//! previous step. Arguments are tagged so that literals, nested sub-queries,
//! captured callbacks, and placeholder variables survive serialization
//! without loss.
//!
//! Serializing a context to JSON and deserializing it back yields a
//! structurally identical context, so the representation can cross any
//! JSON-capable transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single argument to a query step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryArg {
    /// A literal host value carried verbatim.
    Value { value: Value },

    /// A nested sub-query, tagged with the role it plays in the parent step
    /// (for example "sub" for inline expressions or "join" for join operands).
    Query { query: String, value: Vec<QueryStep> },

    /// A captured callback body. `vars` lists the placeholder indices the
    /// body closes over; the executor binds them positionally at call time.
    Func { vars: Vec<u32>, value: Vec<QueryStep> },

    /// An array whose elements may themselves be captured expressions.
    Array { value: Vec<QueryArg> },

    /// An object whose values may themselves be captured expressions.
    /// Keys are kept sorted so serialization is deterministic.
    Object { value: BTreeMap<String, QueryArg> },

    /// A reference to a callback placeholder variable.
    Var { value: u32 },
}

impl QueryArg {
    /// Wraps a plain JSON value as a literal argument.
    pub fn value(value: impl Into<Value>) -> Self {
        QueryArg::Value {
            value: value.into(),
        }
    }

    /// Wraps a step list as a sub-query argument with the given role tag.
    pub fn query(tag: impl Into<String>, steps: Vec<QueryStep>) -> Self {
        QueryArg::Query {
            query: tag.into(),
            value: steps,
        }
    }

    /// Returns the literal value if this argument is a literal.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            QueryArg::Value { value } => Some(value),
            _ => None,
        }
    }
}

/// One operation in a query pipeline.
///
/// The first step of a pipeline establishes the data source (a table
/// selection, a literal datum, or a bound variable); every following step
/// receives the previous step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStep {
    /// Operation identifier, e.g. "table", "filter", "insert".
    pub id: String,

    /// Positional arguments of the operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<QueryArg>,

    /// Named options of the operation, e.g. {"index": "email"}.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<Map<String, Value>>,
}

impl QueryStep {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            args: Vec::new(),
            opts: None,
        }
    }

    #[must_use]
    pub fn with_arg(mut self, arg: QueryArg) -> Self {
        self.args.push(arg);
        self
    }

    #[must_use]
    pub fn with_opt(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.opts
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Returns the option value under `key`, if any.
    pub fn opt(&self, key: &str) -> Option<&Value> {
        self.opts.as_ref().and_then(|opts| opts.get(key))
    }
}

/// An ordered pipeline of query steps, ready to hand to an executor.
///
/// Contexts serialize transparently as a JSON array of steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryContext {
    pub steps: Vec<QueryStep>,
}

impl QueryContext {
    pub fn new(steps: Vec<QueryStep>) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Operation id of the final step, used to classify a pipeline
    /// (e.g. whether it ends in a change feed).
    pub fn last_id(&self) -> Option<&str> {
        self.steps.last().map(|step| step.id.as_str())
    }
}
