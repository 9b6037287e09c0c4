//! Request-driven filter predicates for List.

use super::{ApiError, ApiResult, RequestContext};
use crate::error::TidewireResult;
use crate::query::{BoolExpr, CompareOp, ObjExpr};
use serde_json::Value;
use std::str::FromStr;

/// Builds the predicate for one registered filter. `row` is the captured
/// row placeholder and `field` the stored field the filter targets; the
/// returned expression joins the query's filter step.
pub trait FilterBuilder: Send + Sync {
    fn build(
        &self,
        ctx: &RequestContext,
        row: ObjExpr,
        field: &str,
        value: &Value,
        op: CompareOp,
    ) -> TidewireResult<BoolExpr>;
}

/// Compares the stored field against the supplied value with the supplied
/// operator. Operator legality is checked while building, so an invalid
/// combination never reaches the executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFilter;

impl StandardFilter {
    pub fn new() -> Self {
        Self
    }
}

impl FilterBuilder for StandardFilter {
    fn build(
        &self,
        _ctx: &RequestContext,
        row: ObjExpr,
        field: &str,
        value: &Value,
        op: CompareOp,
    ) -> TidewireResult<BoolExpr> {
        Ok(row.index(field).compare(op, value.clone())?)
    }
}

/// Compares one locale's sub-value of a localized container field, using
/// the locale carried by the request context.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalizedFilter;

impl LocalizedFilter {
    pub fn new() -> Self {
        Self
    }
}

impl FilterBuilder for LocalizedFilter {
    fn build(
        &self,
        ctx: &RequestContext,
        row: ObjExpr,
        field: &str,
        value: &Value,
        op: CompareOp,
    ) -> TidewireResult<BoolExpr> {
        let locale = ctx.locale.as_deref().ok_or_else(|| {
            ApiError::Validation(format!("filter on `{}` requires a request locale", field))
        })?;
        let localized = row.index(field).try_object()?.index(locale);
        Ok(localized.compare(op, value.clone())?)
    }
}

/// Splits a filter parameter into its comparison value and operator.
/// Accepted shapes: a bare value, `[value]`, or `[value, operator]`; the
/// operator defaults to equality.
pub fn parse_filter_param(param: &Value) -> ApiResult<(Value, CompareOp)> {
    match param {
        Value::Array(parts) => match parts.as_slice() {
            [value] => Ok((value.clone(), CompareOp::Eq)),
            [value, op] => {
                let op = op.as_str().ok_or_else(|| {
                    ApiError::Validation(format!("filter operator must be a string, got {}", op))
                })?;
                let op = CompareOp::from_str(op)
                    .map_err(|err| ApiError::Validation(err.to_string()))?;
                Ok((value.clone(), op))
            }
            _ => Err(ApiError::Validation(
                "filter parameters take [value] or [value, operator]".to_string(),
            )),
        },
        value => Ok((value.clone(), CompareOp::Eq)),
    }
}
