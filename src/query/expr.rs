use super::{Category, CompareOp, ExprError, ExprResult};
use crate::ir::{QueryArg, QueryStep};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeMap;

thread_local! {
    static NEXT_VAR: Cell<u32> = const { Cell::new(0) };
}

fn fresh_var() -> u32 {
    NEXT_VAR.with(|counter| {
        let idx = counter.get();
        counter.set(idx.wrapping_add(1));
        idx
    })
}

/// An untyped expression node.
///
/// Every expression is an immutable pipeline of steps rooted at a literal,
/// a bound variable, or a sub-query. Operations never mutate in place; they
/// return a new expression that extends the pipeline. The category tag
/// records what is statically known about the value the pipeline produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    steps: Vec<QueryStep>,
    category: Category,
}

impl Expr {
    /// Builds a literal expression from a plain JSON value. The category is
    /// inferred from the JSON type.
    pub fn lit(value: impl Into<Value>) -> Expr {
        let value = value.into();
        let category = Category::of_value(&value);
        Expr {
            steps: vec![QueryStep::new("datum").with_arg(QueryArg::value(value))],
            category,
        }
    }

    /// A null literal.
    pub fn null() -> Expr {
        Expr::lit(Value::Null)
    }

    pub(crate) fn var(idx: u32, category: Category) -> Expr {
        Expr {
            steps: vec![QueryStep::new("var").with_arg(QueryArg::Var { value: idx })],
            category,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn apply(mut self, step: QueryStep, category: Category) -> Expr {
        self.steps.push(step);
        Expr {
            steps: self.steps,
            category,
        }
    }

    fn cast(self, target: Category) -> ExprResult<Expr> {
        if self.category == target || self.category == Category::Any {
            Ok(Expr {
                steps: self.steps,
                category: target,
            })
        } else {
            Err(ExprError::TypeMismatch {
                expected: target,
                actual: self.category,
            })
        }
    }

    /// Narrows to a boolean expression, failing immediately if the category
    /// is known to be something else.
    pub fn try_bool(self) -> ExprResult<BoolExpr> {
        self.cast(Category::Bool).map(BoolExpr)
    }

    pub fn try_num(self) -> ExprResult<NumExpr> {
        self.cast(Category::Num).map(NumExpr)
    }

    pub fn try_str(self) -> ExprResult<StrExpr> {
        self.cast(Category::Str).map(StrExpr)
    }

    pub fn try_date(self) -> ExprResult<DateExpr> {
        self.cast(Category::Date).map(DateExpr)
    }

    pub fn try_array(self) -> ExprResult<ArrayExpr> {
        self.cast(Category::Array).map(ArrayExpr)
    }

    pub fn try_object(self) -> ExprResult<ObjExpr> {
        self.cast(Category::Object).map(ObjExpr)
    }

    /// Applies a dynamic comparison against a literal value, as used by
    /// request-driven filters. Ordering operators require an orderable
    /// category and `match` requires a string pattern; violations fail here,
    /// before anything is sent to an executor.
    pub fn compare(self, op: CompareOp, value: Value) -> ExprResult<BoolExpr> {
        let orderable = matches!(
            self.category,
            Category::Any | Category::Num | Category::Str | Category::Date
        );
        match op {
            CompareOp::Eq | CompareOp::Ne => {}
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                if !orderable {
                    return Err(ExprError::UnsupportedOperator {
                        op,
                        category: self.category,
                    });
                }
            }
            CompareOp::Contains => {
                if !matches!(
                    self.category,
                    Category::Any | Category::Str | Category::Array
                ) {
                    return Err(ExprError::UnsupportedOperator {
                        op,
                        category: self.category,
                    });
                }
            }
            CompareOp::Match => {
                if !matches!(self.category, Category::Any | Category::Str) {
                    return Err(ExprError::UnsupportedOperator {
                        op,
                        category: self.category,
                    });
                }
                if !value.is_string() {
                    return Err(ExprError::TypeMismatch {
                        expected: Category::Str,
                        actual: Category::of_value(&value),
                    });
                }
            }
        }
        Ok(BoolExpr(self.apply(
            QueryStep::new(op.step_id()).with_arg(QueryArg::value(value)),
            Category::Bool,
        )))
    }

    /// Realizes this expression as a step argument. Bare literals and
    /// variables collapse to their direct argument forms; anything else
    /// becomes a nested sub-query.
    pub(crate) fn into_arg(self) -> QueryArg {
        let mut steps = self.steps;
        if steps.len() == 1 && steps[0].opts.is_none() {
            let QueryStep { id, mut args, opts } = steps.remove(0);
            match (id.as_str(), args.len()) {
                ("datum", 1) | ("var", 1) => return args.remove(0),
                ("make_array", _) => return QueryArg::Array { value: args },
                ("make_object", 1) if matches!(args[0], QueryArg::Object { .. }) => {
                    return args.remove(0)
                }
                _ => steps.push(QueryStep { id, args, opts }),
            }
        }
        QueryArg::query("sub", steps)
    }

    pub(crate) fn into_steps(self) -> Vec<QueryStep> {
        self.steps
    }
}

/// Explicit capture of a row callback.
///
/// [`QueryBuilder::filter`] and friends capture closures automatically; this
/// type is the manual equivalent for callers that need to assemble the body
/// fallibly, such as request-driven filter composition.
///
/// # Example flow
///
/// Begin a capture, build the body against [`RowCapture::row`], then finish
/// to obtain the function argument for [`QueryBuilder::filter_arg`].
pub struct RowCapture {
    var: u32,
}

impl RowCapture {
    #[allow(clippy::new_without_default)]
    pub fn begin() -> Self {
        RowCapture { var: fresh_var() }
    }

    /// The placeholder row this capture binds.
    pub fn row(&self) -> ObjExpr {
        ObjExpr(Expr::var(self.var, Category::Object))
    }

    /// Closes the capture over `body`, producing a function argument.
    pub fn finish(self, body: impl Into<Expr>) -> QueryArg {
        QueryArg::Func {
            vars: vec![self.var],
            value: body.into().into_steps(),
        }
    }
}

pub(crate) fn capture_row<R: Into<Expr>>(f: impl FnOnce(ObjExpr) -> R) -> QueryArg {
    let capture = RowCapture::begin();
    let row = capture.row();
    capture.finish(f(row))
}

pub(crate) fn capture_item<R: Into<Expr>>(f: impl FnOnce(Expr) -> R) -> QueryArg {
    let var = fresh_var();
    let body: Expr = f(Expr::var(var, Category::Any)).into();
    QueryArg::Func {
        vars: vec![var],
        value: body.into_steps(),
    }
}

pub(crate) fn capture_pair<R: Into<Expr>>(f: impl FnOnce(ObjExpr, ObjExpr) -> R) -> QueryArg {
    let left = fresh_var();
    let right = fresh_var();
    let body: Expr = f(
        ObjExpr(Expr::var(left, Category::Object)),
        ObjExpr(Expr::var(right, Category::Object)),
    )
    .into();
    QueryArg::Func {
        vars: vec![left, right],
        value: body.into_steps(),
    }
}

/// A boolean-valued expression.
#[derive(Debug, Clone, PartialEq)]
pub struct BoolExpr(Expr);

impl BoolExpr {
    pub fn and(self, other: impl Into<BoolExpr>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("and").with_arg(other.into().0.into_arg()),
            Category::Bool,
        ))
    }

    pub fn or(self, other: impl Into<BoolExpr>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("or").with_arg(other.into().0.into_arg()),
            Category::Bool,
        ))
    }

    pub fn not(self) -> BoolExpr {
        BoolExpr(self.0.apply(QueryStep::new("not"), Category::Bool))
    }

    pub fn eq(self, other: impl Into<BoolExpr>) -> BoolExpr {
        compare_step(self.0, "eq", other.into().0)
    }

    pub fn ne(self, other: impl Into<BoolExpr>) -> BoolExpr {
        compare_step(self.0, "ne", other.into().0)
    }
}

/// A numeric expression.
#[derive(Debug, Clone, PartialEq)]
pub struct NumExpr(Expr);

impl NumExpr {
    pub fn add(self, other: impl Into<NumExpr>) -> NumExpr {
        NumExpr(self.arith("add", other.into()))
    }

    pub fn sub(self, other: impl Into<NumExpr>) -> NumExpr {
        NumExpr(self.arith("sub", other.into()))
    }

    pub fn mul(self, other: impl Into<NumExpr>) -> NumExpr {
        NumExpr(self.arith("mul", other.into()))
    }

    pub fn div(self, other: impl Into<NumExpr>) -> NumExpr {
        NumExpr(self.arith("div", other.into()))
    }

    fn arith(self, id: &str, other: NumExpr) -> Expr {
        self.0.apply(
            QueryStep::new(id).with_arg(other.0.into_arg()),
            Category::Num,
        )
    }

    pub fn eq(self, other: impl Into<NumExpr>) -> BoolExpr {
        compare_step(self.0, "eq", other.into().0)
    }

    pub fn ne(self, other: impl Into<NumExpr>) -> BoolExpr {
        compare_step(self.0, "ne", other.into().0)
    }

    pub fn lt(self, other: impl Into<NumExpr>) -> BoolExpr {
        compare_step(self.0, "lt", other.into().0)
    }

    pub fn le(self, other: impl Into<NumExpr>) -> BoolExpr {
        compare_step(self.0, "le", other.into().0)
    }

    pub fn gt(self, other: impl Into<NumExpr>) -> BoolExpr {
        compare_step(self.0, "gt", other.into().0)
    }

    pub fn ge(self, other: impl Into<NumExpr>) -> BoolExpr {
        compare_step(self.0, "ge", other.into().0)
    }
}

/// A string expression.
#[derive(Debug, Clone, PartialEq)]
pub struct StrExpr(Expr);

impl StrExpr {
    pub fn eq(self, other: impl Into<StrExpr>) -> BoolExpr {
        compare_step(self.0, "eq", other.into().0)
    }

    pub fn ne(self, other: impl Into<StrExpr>) -> BoolExpr {
        compare_step(self.0, "ne", other.into().0)
    }

    /// Lexicographic ordering.
    pub fn lt(self, other: impl Into<StrExpr>) -> BoolExpr {
        compare_step(self.0, "lt", other.into().0)
    }

    pub fn le(self, other: impl Into<StrExpr>) -> BoolExpr {
        compare_step(self.0, "le", other.into().0)
    }

    pub fn gt(self, other: impl Into<StrExpr>) -> BoolExpr {
        compare_step(self.0, "gt", other.into().0)
    }

    pub fn ge(self, other: impl Into<StrExpr>) -> BoolExpr {
        compare_step(self.0, "ge", other.into().0)
    }

    pub fn concat(self, other: impl Into<StrExpr>) -> StrExpr {
        StrExpr(self.0.apply(
            QueryStep::new("concat").with_arg(other.into().0.into_arg()),
            Category::Str,
        ))
    }

    /// Substring containment.
    pub fn contains(self, other: impl Into<StrExpr>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("contains").with_arg(other.into().0.into_arg()),
            Category::Bool,
        ))
    }

    pub fn starts_with(self, prefix: impl Into<StrExpr>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("starts_with").with_arg(prefix.into().0.into_arg()),
            Category::Bool,
        ))
    }

    pub fn ends_with(self, suffix: impl Into<StrExpr>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("ends_with").with_arg(suffix.into().0.into_arg()),
            Category::Bool,
        ))
    }

    /// Regular expression match, evaluated by the executor.
    pub fn matches(self, pattern: impl Into<StrExpr>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("match").with_arg(pattern.into().0.into_arg()),
            Category::Bool,
        ))
    }

    pub fn upcase(self) -> StrExpr {
        StrExpr(self.0.apply(QueryStep::new("upcase"), Category::Str))
    }

    pub fn downcase(self) -> StrExpr {
        StrExpr(self.0.apply(QueryStep::new("downcase"), Category::Str))
    }

    pub fn len(self) -> NumExpr {
        NumExpr(self.0.apply(QueryStep::new("count"), Category::Num))
    }

    pub fn split(self, separator: impl Into<StrExpr>) -> ArrayExpr {
        ArrayExpr(self.0.apply(
            QueryStep::new("split").with_arg(separator.into().0.into_arg()),
            Category::Array,
        ))
    }
}

/// A date expression. Dates travel as epoch milliseconds on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DateExpr(Expr);

impl DateExpr {
    pub fn eq(self, other: impl Into<DateExpr>) -> BoolExpr {
        compare_step(self.0, "eq", other.into().0)
    }

    pub fn ne(self, other: impl Into<DateExpr>) -> BoolExpr {
        compare_step(self.0, "ne", other.into().0)
    }

    pub fn lt(self, other: impl Into<DateExpr>) -> BoolExpr {
        compare_step(self.0, "lt", other.into().0)
    }

    pub fn le(self, other: impl Into<DateExpr>) -> BoolExpr {
        compare_step(self.0, "le", other.into().0)
    }

    pub fn gt(self, other: impl Into<DateExpr>) -> BoolExpr {
        compare_step(self.0, "gt", other.into().0)
    }

    pub fn ge(self, other: impl Into<DateExpr>) -> BoolExpr {
        compare_step(self.0, "ge", other.into().0)
    }

    pub fn add_secs(self, seconds: impl Into<NumExpr>) -> DateExpr {
        DateExpr(self.0.apply(
            QueryStep::new("add_secs").with_arg(seconds.into().0.into_arg()),
            Category::Date,
        ))
    }

    pub fn sub_secs(self, seconds: impl Into<NumExpr>) -> DateExpr {
        DateExpr(self.0.apply(
            QueryStep::new("sub_secs").with_arg(seconds.into().0.into_arg()),
            Category::Date,
        ))
    }

    /// The underlying epoch-millisecond value as a number.
    pub fn epoch_ms(self) -> NumExpr {
        NumExpr(self.0.apply(QueryStep::new("epoch_ms"), Category::Num))
    }
}

/// An array expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayExpr(Expr);

impl ArrayExpr {
    /// Builds an array from element expressions.
    pub fn of(items: Vec<Expr>) -> ArrayExpr {
        let mut step = QueryStep::new("make_array");
        for item in items {
            step = step.with_arg(item.into_arg());
        }
        ArrayExpr(Expr {
            steps: vec![step],
            category: Category::Array,
        })
    }

    /// Element at `index`; the result has unknown category.
    pub fn nth(self, index: i64) -> Expr {
        self.0.apply(
            QueryStep::new("nth").with_arg(QueryArg::value(index)),
            Category::Any,
        )
    }

    /// Elements in `[start, end)`.
    pub fn slice(self, start: i64, end: i64) -> ArrayExpr {
        ArrayExpr(self.0.apply(
            QueryStep::new("slice")
                .with_arg(QueryArg::value(start))
                .with_arg(QueryArg::value(end)),
            Category::Array,
        ))
    }

    pub fn count(self) -> NumExpr {
        NumExpr(self.0.apply(QueryStep::new("count"), Category::Num))
    }

    /// Membership test against a literal value.
    pub fn contains(self, value: impl Into<Value>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("contains").with_arg(QueryArg::value(value.into())),
            Category::Bool,
        ))
    }

    pub fn append(self, item: Expr) -> ArrayExpr {
        ArrayExpr(self.0.apply(
            QueryStep::new("append").with_arg(item.into_arg()),
            Category::Array,
        ))
    }

    pub fn concat(self, other: ArrayExpr) -> ArrayExpr {
        ArrayExpr(self.0.apply(
            QueryStep::new("concat").with_arg(other.0.into_arg()),
            Category::Array,
        ))
    }

    /// Maps each element through a captured callback.
    pub fn map<R: Into<Expr>>(self, f: impl FnOnce(Expr) -> R) -> ArrayExpr {
        ArrayExpr(self.0.apply(
            QueryStep::new("map").with_arg(capture_item(f)),
            Category::Array,
        ))
    }

    /// Keeps elements for which the captured predicate holds.
    pub fn filter(self, f: impl FnOnce(Expr) -> BoolExpr) -> ArrayExpr {
        ArrayExpr(self.0.apply(
            QueryStep::new("filter").with_arg(capture_item(f)),
            Category::Array,
        ))
    }
}

/// An object expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjExpr(Expr);

impl ObjExpr {
    /// Builds an object from key/expression pairs.
    pub fn of(fields: Vec<(String, Expr)>) -> ObjExpr {
        let mut value = BTreeMap::new();
        for (key, expr) in fields {
            value.insert(key, expr.into_arg());
        }
        ObjExpr(Expr {
            steps: vec![QueryStep::new("make_object").with_arg(QueryArg::Object { value })],
            category: Category::Object,
        })
    }

    /// Looks up `key`, yielding a dynamically-typed handle. Use the `try_*`
    /// casts or the typed field accessors to narrow it.
    pub fn index(self, key: impl Into<String>) -> Expr {
        self.0.apply(
            QueryStep::new("index").with_arg(QueryArg::value(key.into())),
            Category::Any,
        )
    }

    pub fn bool_field(self, key: impl Into<String>) -> BoolExpr {
        BoolExpr(self.index(key).retag(Category::Bool))
    }

    pub fn num_field(self, key: impl Into<String>) -> NumExpr {
        NumExpr(self.index(key).retag(Category::Num))
    }

    pub fn str_field(self, key: impl Into<String>) -> StrExpr {
        StrExpr(self.index(key).retag(Category::Str))
    }

    pub fn date_field(self, key: impl Into<String>) -> DateExpr {
        DateExpr(self.index(key).retag(Category::Date))
    }

    pub fn array_field(self, key: impl Into<String>) -> ArrayExpr {
        ArrayExpr(self.index(key).retag(Category::Array))
    }

    pub fn obj_field(self, key: impl Into<String>) -> ObjExpr {
        ObjExpr(self.index(key).retag(Category::Object))
    }

    pub fn has_field(self, key: impl Into<String>) -> BoolExpr {
        BoolExpr(self.0.apply(
            QueryStep::new("has_field").with_arg(QueryArg::value(key.into())),
            Category::Bool,
        ))
    }

    pub fn keys(self) -> ArrayExpr {
        ArrayExpr(self.0.apply(QueryStep::new("keys"), Category::Array))
    }

    pub fn values(self) -> ArrayExpr {
        ArrayExpr(self.0.apply(QueryStep::new("values"), Category::Array))
    }

    /// Right-biased shallow merge.
    pub fn merge(self, other: impl Into<ObjExpr>) -> ObjExpr {
        ObjExpr(self.0.apply(
            QueryStep::new("merge").with_arg(other.into().0.into_arg()),
            Category::Object,
        ))
    }

    pub fn pluck(self, fields: &[&str]) -> ObjExpr {
        ObjExpr(self.0.apply(
            QueryStep::new("pluck").with_arg(field_list(fields)),
            Category::Object,
        ))
    }

    pub fn without(self, fields: &[&str]) -> ObjExpr {
        ObjExpr(self.0.apply(
            QueryStep::new("without").with_arg(field_list(fields)),
            Category::Object,
        ))
    }

    pub fn eq(self, other: impl Into<ObjExpr>) -> BoolExpr {
        compare_step(self.0, "eq", other.into().0)
    }

    pub fn ne(self, other: impl Into<ObjExpr>) -> BoolExpr {
        compare_step(self.0, "ne", other.into().0)
    }
}

impl Expr {
    fn retag(self, category: Category) -> Expr {
        Expr {
            steps: self.steps,
            category,
        }
    }
}

fn compare_step(lhs: Expr, id: &str, rhs: Expr) -> BoolExpr {
    BoolExpr(lhs.apply(QueryStep::new(id).with_arg(rhs.into_arg()), Category::Bool))
}

pub(crate) fn field_list(fields: &[&str]) -> QueryArg {
    QueryArg::Array {
        value: fields.iter().map(|f| QueryArg::value(*f)).collect(),
    }
}

impl From<BoolExpr> for Expr {
    fn from(expr: BoolExpr) -> Expr {
        expr.0
    }
}

impl From<NumExpr> for Expr {
    fn from(expr: NumExpr) -> Expr {
        expr.0
    }
}

impl From<StrExpr> for Expr {
    fn from(expr: StrExpr) -> Expr {
        expr.0
    }
}

impl From<DateExpr> for Expr {
    fn from(expr: DateExpr) -> Expr {
        expr.0
    }
}

impl From<ArrayExpr> for Expr {
    fn from(expr: ArrayExpr) -> Expr {
        expr.0
    }
}

impl From<ObjExpr> for Expr {
    fn from(expr: ObjExpr) -> Expr {
        expr.0
    }
}

impl From<bool> for BoolExpr {
    fn from(value: bool) -> BoolExpr {
        BoolExpr(Expr::lit(value))
    }
}

impl From<i32> for NumExpr {
    fn from(value: i32) -> NumExpr {
        NumExpr(Expr::lit(value))
    }
}

impl From<i64> for NumExpr {
    fn from(value: i64) -> NumExpr {
        NumExpr(Expr::lit(value))
    }
}

impl From<u32> for NumExpr {
    fn from(value: u32) -> NumExpr {
        NumExpr(Expr::lit(value))
    }
}

impl From<f64> for NumExpr {
    fn from(value: f64) -> NumExpr {
        NumExpr(Expr::lit(value))
    }
}

impl From<&str> for StrExpr {
    fn from(value: &str) -> StrExpr {
        StrExpr(Expr::lit(value))
    }
}

impl From<String> for StrExpr {
    fn from(value: String) -> StrExpr {
        StrExpr(Expr::lit(value))
    }
}

impl From<DateTime<Utc>> for DateExpr {
    fn from(value: DateTime<Utc>) -> DateExpr {
        DateExpr(Expr {
            steps: vec![
                QueryStep::new("datum").with_arg(QueryArg::value(value.timestamp_millis())),
            ],
            category: Category::Date,
        })
    }
}

impl From<serde_json::Map<String, Value>> for ObjExpr {
    fn from(value: serde_json::Map<String, Value>) -> ObjExpr {
        ObjExpr(Expr {
            steps: vec![QueryStep::new("datum").with_arg(QueryArg::value(Value::Object(value)))],
            category: Category::Object,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_categories() {
        assert_eq!(Expr::lit(5).category(), Category::Num);
        assert_eq!(Expr::lit("hi").category(), Category::Str);
        assert_eq!(Expr::null().category(), Category::Any);
    }

    #[test]
    fn test_cast_from_any_succeeds() {
        let expr = Expr::lit(Value::Null);
        assert!(expr.try_num().is_ok());
    }

    #[test]
    fn test_cast_between_concrete_categories_fails() {
        let err = Expr::lit("text").try_num().unwrap_err();
        assert_eq!(
            err,
            ExprError::TypeMismatch {
                expected: Category::Num,
                actual: Category::Str,
            }
        );
    }

    #[test]
    fn test_chains_do_not_mutate_their_receiver() {
        let base = NumExpr::from(2).add(3);
        let doubled = base.clone().mul(2);
        let halved = base.clone().div(2);
        assert_ne!(Expr::from(doubled), Expr::from(halved));
        // The shared prefix is intact in both extensions.
        let base_steps = Expr::from(base).into_steps();
        assert_eq!(base_steps.len(), 2);
    }

    #[test]
    fn test_literal_collapses_to_value_arg() {
        let arg = Expr::lit(7).into_arg();
        assert_eq!(arg, QueryArg::value(7));
    }

    #[test]
    fn test_compound_expression_becomes_sub_query() {
        let arg = Expr::from(NumExpr::from(1).add(2)).into_arg();
        match arg {
            QueryArg::Query { query, value } => {
                assert_eq!(query, "sub");
                assert_eq!(value.len(), 2);
                assert_eq!(value[0].id, "datum");
                assert_eq!(value[1].id, "add");
            }
            other => panic!("expected sub-query, got {:?}", other),
        }
    }

    #[test]
    fn test_capture_binds_row_variable() {
        let arg = capture_row(|row| row.num_field("age").ge(18));
        match arg {
            QueryArg::Func { vars, value } => {
                assert_eq!(vars.len(), 1);
                assert_eq!(value[0].id, "var");
                assert_eq!(value[0].args[0], QueryArg::Var { value: vars[0] });
                assert_eq!(value[1].id, "index");
                assert_eq!(value[2].id, "ge");
            }
            other => panic!("expected func, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_captures_use_distinct_variables() {
        let arg = capture_row(|row| {
            row.array_field("tags")
                .filter(|tag| {
                    tag.try_str()
                        .map(|t| t.eq("rust"))
                        .unwrap_or_else(|_| BoolExpr::from(false))
                })
                .count()
                .gt(0)
        });
        let QueryArg::Func { vars, value } = arg else {
            panic!("expected func");
        };
        let outer = vars[0];
        let nested = value
            .iter()
            .find(|step| step.id == "filter")
            .and_then(|step| step.args.first())
            .cloned();
        let Some(QueryArg::Func { vars: inner, .. }) = nested else {
            panic!("expected nested func");
        };
        assert_ne!(outer, inner[0]);
    }

    #[test]
    fn test_match_rejects_non_string_pattern() {
        let err = Expr::lit("abc").compare(CompareOp::Match, json!(5)).unwrap_err();
        assert!(matches!(err, ExprError::TypeMismatch { .. }));
    }

    #[test]
    fn test_ordering_rejected_for_bool() {
        let err = Expr::lit(true).compare(CompareOp::Gt, json!(1)).unwrap_err();
        assert!(matches!(err, ExprError::UnsupportedOperator { .. }));
    }

    #[test]
    fn test_date_literal_travels_as_epoch_ms() {
        let date = chrono::DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let expr = DateExpr::from(date);
        let arg = Expr::from(expr).into_arg();
        assert_eq!(arg, QueryArg::value(date.timestamp_millis()));
    }

    #[test]
    fn test_object_of_collapses_to_object_arg() {
        let arg = Expr::from(ObjExpr::of(vec![
            ("a".to_string(), Expr::lit(1)),
            ("b".to_string(), Expr::lit("two")),
        ]))
        .into_arg();
        match arg {
            QueryArg::Object { value } => {
                assert_eq!(value.len(), 2);
                assert_eq!(value["a"], QueryArg::value(1));
            }
            other => panic!("expected object arg, got {:?}", other),
        }
    }
}
