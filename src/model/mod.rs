//! # Data Model Layer
//!
//! [`Model`] wraps a single registered table with typed CRUD conveniences
//! over the query engine. It owns the two conversion boundaries around
//! storage: [`Model::from_plain_data`] locks every modifier-bearing field
//! on the way in, and [`Model::from_database`] rebuilds rows on the way
//! out without unlocking anything, so protected fields stay protected
//! until a caller explicitly unlocks or tests them.
//!
//! Write operations report per-row failures through [`WriteReport`]
//! instead of raising; only protocol-level faults surface as errors.

mod write;

pub use write::WriteReport;

use crate::error::TidewireResult;
use crate::executor::{ProtocolError, QueryExecutor};
use crate::modifier::MODS_KEY;
use crate::query::{Conflict, QueryBuilder, RowCapture};
use crate::schema::{SchemaRegistry, TableDescriptor};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Typed access to one table.
#[derive(Clone)]
pub struct Model {
    schema: String,
    descriptor: Arc<TableDescriptor>,
    executor: Arc<dyn QueryExecutor>,
}

impl Model {
    pub fn new(
        schema: impl Into<String>,
        descriptor: Arc<TableDescriptor>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            schema: schema.into(),
            descriptor,
            executor,
        }
    }

    /// Builds a model for a table already registered under `schema`.
    pub fn from_registry(
        registry: &SchemaRegistry,
        schema: &str,
        table: &str,
        executor: Arc<dyn QueryExecutor>,
    ) -> TidewireResult<Self> {
        let descriptor = registry.descriptor(schema, table)?;
        Ok(Self::new(schema, descriptor, executor))
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn executor(&self) -> Arc<dyn QueryExecutor> {
        Arc::clone(&self.executor)
    }

    /// Starts a query chain over this table.
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::table(&self.schema, self.descriptor.table())
    }

    /// Runs an arbitrary chain against this model's executor.
    pub async fn run(&self, builder: QueryBuilder) -> TidewireResult<Value> {
        builder.run(self.executor.as_ref()).await
    }

    /// Creates the table, its declared indexes, and the fixture rows. The
    /// fixture is seeded only on the call that actually created the table,
    /// so repeated calls are safe.
    pub async fn ensure_table(&self) -> TidewireResult<bool> {
        let result = QueryBuilder::table_create(
            &self.schema,
            self.descriptor.table(),
            self.descriptor.primary_key(),
        )
        .run(self.executor.as_ref())
        .await?;
        let created = result
            .get("tables_created")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            == 1;
        if !created {
            return Ok(false);
        }
        for index in self.descriptor.indexes() {
            let fields: Vec<&str> = index.fields.iter().map(String::as_str).collect();
            self.query()
                .index_create(&index.name, &fields)
                .run(self.executor.as_ref())
                .await?;
        }
        if let Some(rows) = self.descriptor.fixture_rows() {
            let count = rows.len();
            let report = self.insert(rows, Conflict::Error).await?;
            if report.is_clean() {
                log::info!(
                    "seeded `{}` with {} fixture rows",
                    self.descriptor.table(),
                    count
                );
            } else {
                log::warn!(
                    "fixture seeding for `{}` reported {} errors: {}",
                    self.descriptor.table(),
                    report.errors,
                    report.first_error.as_deref().unwrap_or("unknown")
                );
            }
        }
        Ok(created)
    }

    /// Fetches one row by primary key.
    pub async fn get(&self, key: impl Into<Value>) -> TidewireResult<Option<Value>> {
        let result = self.query().get(key).run(self.executor.as_ref()).await?;
        Ok(match result {
            Value::Null => None,
            row => Some(self.from_database(row)),
        })
    }

    /// Fetches zero or more rows matching `keys` on a declared index.
    pub async fn get_by(&self, index: &str, keys: Vec<Value>) -> TidewireResult<Vec<Value>> {
        self.descriptor.index(index)?;
        let result = self
            .query()
            .get_all_by(index, keys)
            .run(self.executor.as_ref())
            .await?;
        Ok(expect_rows(result)?
            .into_iter()
            .map(|row| self.from_database(row))
            .collect())
    }

    /// Fetches the rows whose primary keys appear in `keys`. Missing keys
    /// are simply absent from the result.
    pub async fn get_many(&self, keys: Vec<Value>) -> TidewireResult<Vec<Value>> {
        let result = self
            .query()
            .get_all(keys)
            .run(self.executor.as_ref())
            .await?;
        Ok(expect_rows(result)?
            .into_iter()
            .map(|row| self.from_database(row))
            .collect())
    }

    /// Fetches every row of the table.
    pub async fn get_all(&self) -> TidewireResult<Vec<Value>> {
        let result = self.query().run(self.executor.as_ref()).await?;
        Ok(expect_rows(result)?
            .into_iter()
            .map(|row| self.from_database(row))
            .collect())
    }

    pub async fn insert(&self, rows: Vec<Value>, conflict: Conflict) -> TidewireResult<WriteReport> {
        self.insert_with_args(rows, conflict, &[]).await
    }

    /// Inserts plain rows, locking modifier-bearing fields first. Rows that
    /// fail conversion are counted in the report and skipped, matching how
    /// the engine reports its own per-row failures.
    pub async fn insert_with_args(
        &self,
        rows: Vec<Value>,
        conflict: Conflict,
        args: &[Value],
    ) -> TidewireResult<WriteReport> {
        let mut report = WriteReport::default();
        let mut converted = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.from_plain_data_with_args(row, args) {
                Ok(row) => converted.push(row),
                Err(err) => report.row_error(err.to_string()),
            }
        }
        if converted.is_empty() {
            return Ok(report);
        }
        let result = self
            .query()
            .insert(converted, conflict)
            .run(self.executor.as_ref())
            .await?;
        report.merge(WriteReport::from_value(result)?);
        Ok(report)
    }

    pub async fn update(&self, key: impl Into<Value>, patch: Value) -> TidewireResult<WriteReport> {
        self.update_with_args(key, patch, &[]).await
    }

    /// Applies a partial update. When the patch touches modifier-bearing
    /// fields the current row is fetched first, so container layers merge
    /// into what is already stored instead of clobbering it.
    pub async fn update_with_args(
        &self,
        key: impl Into<Value>,
        patch: Value,
        args: &[Value],
    ) -> TidewireResult<WriteReport> {
        let key = key.into();
        let patch = self.lock_patch(&key, patch, args).await?;
        let result = self
            .query()
            .get(key)
            .update(patch)
            .run(self.executor.as_ref())
            .await?;
        WriteReport::from_value(result)
    }

    pub async fn delete(&self, key: impl Into<Value>) -> TidewireResult<WriteReport> {
        let result = self
            .query()
            .get(key)
            .delete()
            .run(self.executor.as_ref())
            .await?;
        WriteReport::from_value(result)
    }

    pub async fn delete_many(&self, keys: Vec<Value>) -> TidewireResult<WriteReport> {
        let result = self
            .query()
            .get_all(keys)
            .delete()
            .run(self.executor.as_ref())
            .await?;
        WriteReport::from_value(result)
    }

    pub fn from_plain_data(&self, row: &Value) -> TidewireResult<Value> {
        self.from_plain_data_with_args(row, &[])
    }

    /// Converts a plain application row into its stored form: every field
    /// with an attached modifier stack is locked, and the resulting layer
    /// metadata lands under the reserved bookkeeping key. Non-object rows
    /// pass through untouched; the engine reports those itself.
    pub fn from_plain_data_with_args(&self, row: &Value, args: &[Value]) -> TidewireResult<Value> {
        let Some(object) = row.as_object() else {
            return Ok(row.clone());
        };
        let mut out = object.clone();
        out.remove(MODS_KEY);
        let mut mods = Map::new();
        for (field, stack) in self.descriptor.modified_fields() {
            let Some(plain) = object.get(field) else {
                continue;
            };
            let locked = stack.lock(None, plain, args)?;
            out.insert(field.to_string(), locked.value);
            mods.insert(field.to_string(), Value::Array(locked.metas));
        }
        if !mods.is_empty() {
            out.insert(MODS_KEY.to_string(), Value::Object(mods));
        }
        Ok(Value::Object(out))
    }

    /// Rebuilds an application row from its stored representation. Nothing
    /// is unlocked here: locked fields and their metadata come back as
    /// stored, and callers reach for [`Model::unlock_field`] or
    /// [`Model::test_field`] when they actually need the plain value.
    pub fn from_database(&self, row: Value) -> Value {
        row
    }

    /// Unlocks one field of a stored row. Fields without modifiers are
    /// returned as-is.
    pub fn unlock_field(&self, row: &Value, field: &str, args: &[Value]) -> TidewireResult<Value> {
        let Some(stack) = self.descriptor.stack(field) else {
            return Ok(row.get(field).cloned().unwrap_or(Value::Null));
        };
        let locked = row.get(field).cloned().unwrap_or(Value::Null);
        let metas = field_metas(row, field);
        Ok(stack.unlock(&locked, &metas, args)?)
    }

    /// Checks a candidate plain value against a stored field without
    /// unlocking it. For unmodified fields this is plain equality.
    pub fn test_field(
        &self,
        row: &Value,
        field: &str,
        candidate: &Value,
        args: &[Value],
    ) -> TidewireResult<bool> {
        let Some(stack) = self.descriptor.stack(field) else {
            return Ok(row.get(field) == Some(candidate));
        };
        let locked = row.get(field).cloned().unwrap_or(Value::Null);
        let metas = field_metas(row, field);
        Ok(stack.test(&locked, &metas, candidate, args)?)
    }

    /// Builds a chain that yields `field` unlocked inside the query, so the
    /// inverse transform runs remotely instead of after materialization.
    pub fn unlock_in_query(&self, field: &str, args: &[Value]) -> TidewireResult<QueryBuilder> {
        let capture = RowCapture::begin();
        let selected = capture.row().index(field);
        let body = match self.descriptor.stack(field) {
            Some(stack) => stack.unlock_expr(selected, args)?,
            None => selected,
        };
        Ok(self.query().map_arg(capture.finish(body)))
    }

    async fn lock_patch(&self, key: &Value, patch: Value, args: &[Value]) -> TidewireResult<Value> {
        let Some(object) = patch.as_object() else {
            return Ok(patch);
        };
        let mut out = object.clone();
        out.remove(MODS_KEY);
        if !self
            .descriptor
            .modified_fields()
            .any(|(field, _)| object.contains_key(field))
        {
            return Ok(Value::Object(out));
        }
        let current = self
            .query()
            .get(key.clone())
            .run(self.executor.as_ref())
            .await?;
        let mut mods = Map::new();
        for (field, stack) in self.descriptor.modified_fields() {
            let Some(plain) = object.get(field) else {
                continue;
            };
            let stored_metas = field_metas(&current, field);
            let stored = current
                .get(field)
                .map(|value| (value, stored_metas.as_slice()));
            let locked = stack.lock(stored, plain, args)?;
            out.insert(field.to_string(), locked.value);
            mods.insert(field.to_string(), Value::Array(locked.metas));
        }
        if !mods.is_empty() {
            out.insert(MODS_KEY.to_string(), Value::Object(mods));
        }
        Ok(Value::Object(out))
    }
}

fn field_metas(row: &Value, field: &str) -> Vec<Value> {
    row.get(MODS_KEY)
        .and_then(|mods| mods.get(field))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn expect_rows(value: Value) -> TidewireResult<Vec<Value>> {
    match value {
        Value::Array(rows) => Ok(rows),
        other => {
            Err(ProtocolError::Malformed(format!("expected a row array, got {}", other)).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TidewireError;
    use crate::executor::mock::MockEngine;
    use crate::modifier::{
        DigestModifier, LocalizedModifier, ModifierError, PasswordModifier,
    };
    use serde_json::json;

    fn model(descriptor: TableDescriptor, engine: &Arc<MockEngine>) -> Model {
        Model::new("app", Arc::new(descriptor), engine.clone())
    }

    #[tokio::test]
    async fn test_ensure_table_seeds_fixture_exactly_once() {
        let engine = Arc::new(MockEngine::new());
        let users = model(
            TableDescriptor::new("users")
                .with_index("email")
                .with_fixture(|| {
                    vec![
                        json!({"id": "u1", "email": "a@x.com"}),
                        json!({"id": "u2", "email": "b@x.com"}),
                    ]
                }),
            &engine,
        );
        assert!(users.ensure_table().await.unwrap());
        assert_eq!(engine.table_rows("app", "users").await.len(), 2);
        assert!(!users.ensure_table().await.unwrap());
        assert_eq!(engine.table_rows("app", "users").await.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_locks_attached_fields() {
        let engine = Arc::new(MockEngine::new());
        let users = model(
            TableDescriptor::new("users")
                .with_modifier("password", Arc::new(DigestModifier::with_seed(1))),
            &engine,
        );
        users.ensure_table().await.unwrap();
        let report = users
            .insert(vec![json!({"id": "u1", "password": "secret123"})], Conflict::Error)
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);

        let row = users.get("u1").await.unwrap().unwrap();
        assert_ne!(row["password"], json!("secret123"));
        assert_eq!(row[MODS_KEY]["password"].as_array().unwrap().len(), 1);
        assert!(users
            .test_field(&row, "password", &json!("secret123"), &[])
            .unwrap());
        assert!(!users
            .test_field(&row, "password", &json!("wrong"), &[])
            .unwrap());
        assert!(matches!(
            users.unlock_field(&row, "password", &[]),
            Err(TidewireError::Modifier(
                ModifierError::OperationNotSupported { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_get_by_reads_through_a_declared_index() {
        let engine = Arc::new(MockEngine::new());
        let users = model(TableDescriptor::new("users").with_index("email"), &engine);
        users.ensure_table().await.unwrap();
        users
            .insert(
                vec![
                    json!({"id": "u1", "email": "a@x.com"}),
                    json!({"id": "u2", "email": "b@x.com"}),
                ],
                Conflict::Error,
            )
            .await
            .unwrap();

        let matches = users.get_by("email", vec![json!("a@x.com")]).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["id"], json!("u1"));
        assert!(matches!(
            users.get_by("name", vec![json!("x")]).await,
            Err(TidewireError::Schema(_))
        ));
    }

    #[tokio::test]
    async fn test_update_merges_localized_content() {
        let engine = Arc::new(MockEngine::new());
        let pages = model(
            TableDescriptor::new("pages")
                .with_modifier("greeting", Arc::new(LocalizedModifier::new())),
            &engine,
        );
        pages.ensure_table().await.unwrap();
        pages
            .insert_with_args(
                vec![json!({"id": "front", "greeting": "Hallo"})],
                Conflict::Error,
                &[json!("de")],
            )
            .await
            .unwrap();
        pages
            .update_with_args("front", json!({"greeting": "Hello"}), &[json!("en")])
            .await
            .unwrap();

        let row = pages.get("front").await.unwrap().unwrap();
        assert_eq!(
            pages.unlock_field(&row, "greeting", &[json!("de")]).unwrap(),
            json!("Hallo")
        );
        assert_eq!(
            pages.unlock_field(&row, "greeting", &[json!("en")]).unwrap(),
            json!("Hello")
        );
    }

    #[tokio::test]
    async fn test_conversion_failures_are_reported_not_raised() {
        let engine = Arc::new(MockEngine::new());
        let users = model(
            TableDescriptor::new("users")
                .with_modifier("password", Arc::new(PasswordModifier::with_seed(2))),
            &engine,
        );
        users.ensure_table().await.unwrap();
        let report = users
            .insert(
                vec![
                    json!({"id": "u1", "password": "ok"}),
                    json!({"id": "u2", "password": 42}),
                ],
                Conflict::Error,
            )
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.errors, 1);
        assert!(report.first_error.unwrap().contains("not a string"));
    }

    #[tokio::test]
    async fn test_unlock_in_query_runs_the_inverse_remotely() {
        let engine = Arc::new(MockEngine::new());
        let pages = model(
            TableDescriptor::new("pages")
                .with_modifier("greeting", Arc::new(LocalizedModifier::new())),
            &engine,
        );
        pages.ensure_table().await.unwrap();
        pages
            .insert_with_args(
                vec![
                    json!({"id": "a", "greeting": "Hallo"}),
                    json!({"id": "b", "greeting": "Moin"}),
                ],
                Conflict::Error,
                &[json!("de")],
            )
            .await
            .unwrap();

        let chain = pages.unlock_in_query("greeting", &[json!("de")]).unwrap();
        let result = pages.run(chain).await.unwrap();
        assert_eq!(result, json!(["Hallo", "Moin"]));
    }

    #[tokio::test]
    async fn test_delete_many_aggregates_counts() {
        let engine = Arc::new(MockEngine::new());
        let users = model(TableDescriptor::new("users"), &engine);
        users.ensure_table().await.unwrap();
        users
            .insert(
                vec![
                    json!({"id": "u1"}),
                    json!({"id": "u2"}),
                    json!({"id": "u3"}),
                ],
                Conflict::Error,
            )
            .await
            .unwrap();
        let report = users
            .delete_many(vec![json!("u1"), json!("u3")])
            .await
            .unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(users.get_all().await.unwrap().len(), 1);
    }
}
