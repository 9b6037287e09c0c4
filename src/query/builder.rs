use super::expr::{capture_pair, capture_row, field_list, BoolExpr, Expr, ObjExpr};
use crate::error::TidewireResult;
use crate::executor::{Cursor, QueryExecutor};
use crate::ir::{QueryArg, QueryContext, QueryStep};
use serde_json::Value;
use std::sync::Arc;

/// Sort direction for ordered reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// Conflict policy applied when an insert hits an existing primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conflict {
    /// Count the row as a per-row error in the write report.
    #[default]
    Error,
    /// Replace the stored row wholesale.
    Replace,
    /// Merge the new row into the stored row.
    Update,
}

impl Conflict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conflict::Error => "error",
            Conflict::Replace => "replace",
            Conflict::Update => "update",
        }
    }
}

/// A lazily-captured query chain rooted at a table.
///
/// Every method clones nothing and sends nothing; it extends the captured
/// step list and returns a new builder. The chain is realized into a
/// [`QueryContext`] and handed to an executor only inside [`QueryBuilder::run`]
/// or [`QueryBuilder::cursor`]. Builders are cheap to clone, so a shared
/// prefix can be consumed several ways (for example a count and a page).
#[derive(Debug, Clone, PartialEq)]
#[must_use = "query chains are lazy and do nothing until run or iterated"]
pub struct QueryBuilder {
    steps: Vec<QueryStep>,
}

impl QueryBuilder {
    /// Starts a chain over `table` inside the namespace `schema`.
    pub fn table(schema: &str, table: &str) -> QueryBuilder {
        QueryBuilder {
            steps: vec![
                QueryStep::new("db").with_arg(QueryArg::value(schema)),
                QueryStep::new("table").with_arg(QueryArg::value(table)),
            ],
        }
    }

    /// A table-creation request. The executor reports how many tables it
    /// actually created, so repeated calls are safe.
    pub fn table_create(schema: &str, table: &str, primary_key: &str) -> QueryBuilder {
        QueryBuilder {
            steps: vec![
                QueryStep::new("db").with_arg(QueryArg::value(schema)),
                QueryStep::new("table_create")
                    .with_arg(QueryArg::value(table))
                    .with_opt("primary_key", primary_key),
            ],
        }
    }

    /// Declares a secondary index over one or more fields.
    pub fn index_create(self, name: &str, fields: &[&str]) -> QueryBuilder {
        self.push(
            QueryStep::new("index_create")
                .with_arg(QueryArg::value(name))
                .with_arg(field_list(fields)),
        )
    }

    fn push(mut self, step: QueryStep) -> QueryBuilder {
        self.steps.push(step);
        self
    }

    /// Selects a single row by primary key.
    pub fn get(self, key: impl Into<Value>) -> QueryBuilder {
        self.push(QueryStep::new("get").with_arg(QueryArg::value(key.into())))
    }

    /// Selects rows matching any of `keys` on the primary key.
    pub fn get_all(self, keys: Vec<Value>) -> QueryBuilder {
        let mut step = QueryStep::new("get_all");
        for key in keys {
            step = step.with_arg(QueryArg::value(key));
        }
        self.push(step)
    }

    /// Selects rows matching any of `keys` on a named secondary index.
    pub fn get_all_by(self, index: &str, keys: Vec<Value>) -> QueryBuilder {
        let mut step = QueryStep::new("get_all").with_opt("index", index);
        for key in keys {
            step = step.with_arg(QueryArg::value(key));
        }
        self.push(step)
    }

    /// Selects rows whose primary key lies in `[lower, upper)`.
    pub fn between(self, lower: impl Into<Value>, upper: impl Into<Value>) -> QueryBuilder {
        self.push(
            QueryStep::new("between")
                .with_arg(QueryArg::value(lower.into()))
                .with_arg(QueryArg::value(upper.into())),
        )
    }

    /// Selects rows whose index value lies in `[lower, upper)`.
    pub fn between_by(
        self,
        index: &str,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> QueryBuilder {
        self.push(
            QueryStep::new("between")
                .with_arg(QueryArg::value(lower.into()))
                .with_arg(QueryArg::value(upper.into()))
                .with_opt("index", index),
        )
    }

    /// Keeps rows for which the captured predicate holds.
    pub fn filter(self, f: impl FnOnce(ObjExpr) -> BoolExpr) -> QueryBuilder {
        self.push(QueryStep::new("filter").with_arg(capture_row(f)))
    }

    /// Keeps rows matching a pre-captured predicate, as produced by
    /// [`super::RowCapture`].
    pub fn filter_arg(self, predicate: QueryArg) -> QueryBuilder {
        self.push(QueryStep::new("filter").with_arg(predicate))
    }

    /// Transforms each row through a captured callback.
    pub fn map<R: Into<Expr>>(self, f: impl FnOnce(ObjExpr) -> R) -> QueryBuilder {
        self.push(QueryStep::new("map").with_arg(capture_row(f)))
    }

    /// Transforms each row through a pre-captured callback, as produced by
    /// [`super::RowCapture`].
    pub fn map_arg(self, body: QueryArg) -> QueryBuilder {
        self.push(QueryStep::new("map").with_arg(body))
    }

    /// Orders rows by a field value.
    pub fn order_by(self, field: &str, direction: Direction) -> QueryBuilder {
        self.push(
            QueryStep::new("order_by")
                .with_arg(QueryArg::value(field))
                .with_opt("direction", direction.as_str()),
        )
    }

    /// Orders rows by a named index, letting the executor use it.
    pub fn order_by_index(self, index: &str, direction: Direction) -> QueryBuilder {
        self.push(
            QueryStep::new("order_by")
                .with_opt("index", index)
                .with_opt("direction", direction.as_str()),
        )
    }

    pub fn skip(self, count: u64) -> QueryBuilder {
        self.push(QueryStep::new("skip").with_arg(QueryArg::value(count)))
    }

    pub fn limit(self, count: u64) -> QueryBuilder {
        self.push(QueryStep::new("limit").with_arg(QueryArg::value(count)))
    }

    pub fn count(self) -> QueryBuilder {
        self.push(QueryStep::new("count"))
    }

    /// Projects each row down to the named fields.
    pub fn pluck(self, fields: &[&str]) -> QueryBuilder {
        self.push(QueryStep::new("pluck").with_arg(field_list(fields)))
    }

    /// Drops the named fields from each row.
    pub fn without(self, fields: &[&str]) -> QueryBuilder {
        self.push(QueryStep::new("without").with_arg(field_list(fields)))
    }

    /// Groups rows by a field value.
    pub fn group(self, field: &str) -> QueryBuilder {
        self.push(QueryStep::new("group").with_arg(QueryArg::value(field)))
    }

    /// Joins on equality between `field` and the other table's primary key.
    /// The joined chain travels as a tagged sub-query.
    pub fn eq_join(self, field: &str, other: QueryBuilder) -> QueryBuilder {
        self.push(
            QueryStep::new("eq_join")
                .with_arg(QueryArg::value(field))
                .with_arg(QueryArg::query("join", other.steps)),
        )
    }

    /// Joins against another chain with a captured two-row predicate.
    pub fn inner_join(
        self,
        other: QueryBuilder,
        f: impl FnOnce(ObjExpr, ObjExpr) -> BoolExpr,
    ) -> QueryBuilder {
        self.push(
            QueryStep::new("inner_join")
                .with_arg(QueryArg::query("join", other.steps))
                .with_arg(capture_pair(f)),
        )
    }

    /// Turns the chain into a change feed. Feeds never terminate on their
    /// own; consume them through a cursor and close it to cancel.
    pub fn changes(self) -> QueryBuilder {
        self.push(QueryStep::new("changes"))
    }

    /// Inserts rows with the given conflict policy.
    pub fn insert(self, rows: Vec<Value>, conflict: Conflict) -> QueryBuilder {
        self.push(
            QueryStep::new("insert")
                .with_arg(QueryArg::Array {
                    value: rows.into_iter().map(QueryArg::value).collect(),
                })
                .with_opt("conflict", conflict.as_str()),
        )
    }

    /// Merges a literal patch into every selected row.
    pub fn update(self, patch: Value) -> QueryBuilder {
        self.push(QueryStep::new("update").with_arg(QueryArg::value(patch)))
    }

    /// Updates every selected row through a captured callback.
    pub fn update_with<R: Into<Expr>>(self, f: impl FnOnce(ObjExpr) -> R) -> QueryBuilder {
        self.push(QueryStep::new("update").with_arg(capture_row(f)))
    }

    /// Deletes every selected row.
    pub fn delete(self) -> QueryBuilder {
        self.push(QueryStep::new("delete"))
    }

    /// Realizes the chain without consuming the builder.
    pub fn context(&self) -> QueryContext {
        QueryContext::new(self.steps.clone())
    }

    /// Realizes the chain into its portable form.
    pub fn into_context(self) -> QueryContext {
        QueryContext::new(self.steps)
    }

    /// Realizes the chain and executes it to completion.
    pub async fn run(self, executor: &dyn QueryExecutor) -> TidewireResult<Value> {
        let ctx = self.into_context();
        Ok(executor.run_query(&ctx).await?)
    }

    /// Realizes the chain and opens a cursor over its results. For chains
    /// ending in [`QueryBuilder::changes`] the cursor is a change feed.
    pub fn cursor(self, executor: Arc<dyn QueryExecutor>) -> Cursor {
        Cursor::open(executor, self.into_context())
    }
}
