//! Synthesized CRUD operations over one entity.
//!
//! [`DataApi`] turns a frozen [`DataApiMeta`] and a [`Model`] into the
//! five generic operations. Every byte a caller sees or writes passes
//! through the field metadata: reads project to readable fields and run
//! computed getters, list results honor listability and declared filters
//! and sorts, writes strip undeclared and non-writable fields, check
//! mandatory sets and run validators before the model locks and stores
//! the row.

use super::filter::parse_filter_param;
use super::meta::{DataApiMeta, Operation};
use super::registry::{ApiEntry, DataApiRegistry};
use super::{ApiError, ApiResult, Listable, RequestContext, Sortable};
use crate::config::EngineConfig;
use crate::error::{TidewireError, TidewireResult};
use crate::executor::ProtocolError;
use crate::model::{Model, WriteReport};
use crate::query::{Conflict, Direction, QueryBuilder, RowCapture};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Parameters of the Get operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetParams {
    pub id: Value,
    /// Look the row up through this declared index instead of the
    /// primary key.
    pub index: Option<String>,
    pub no_foreign: bool,
}

/// Parameters of the List operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    /// Filter name to filter parameter. Parameters are a bare value, a
    /// one-element array, or `[value, operator]`.
    pub filters: BTreeMap<String, Value>,
    pub offset: u64,
    pub limit: Option<u64>,
    pub sort_key: Option<String>,
    /// `"asc"` (default) or `"desc"`.
    pub sort_direction: Option<String>,
    /// Per-request page ceiling. Never raises the configured maximum.
    pub max_page: Option<u64>,
    pub no_foreign: bool,
    /// Skip both server-side pluck and projection, returning raw rows.
    pub no_pluck: bool,
    pub pluck_mode: Option<PluckMode>,
}

/// Which field set a list projects rows down to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluckMode {
    Listable,
    Readable,
}

/// Parameters of the New operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewParams {
    pub body: Value,
    /// Skip the mandatory-field presence check.
    pub no_mandatory: bool,
}

/// Parameters of the Edit operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EditParams {
    pub id: Value,
    pub index: Option<String>,
    pub body: Value,
    pub no_mandatory: bool,
}

/// Parameters of the Delete operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteParams {
    pub id: Vec<Value>,
}

/// One page of list results. `total` counts every row matching the
/// filters, ignoring pagination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResult {
    pub results: Vec<Value>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Projection {
    Readable,
    Listable,
}

/// Metadata-driven endpoints for one entity.
#[derive(Clone)]
pub struct DataApi {
    meta: Arc<DataApiMeta>,
    model: Model,
    resolver: Option<Arc<DataApiRegistry>>,
    config: Arc<EngineConfig>,
}

impl DataApi {
    pub fn new(meta: Arc<DataApiMeta>, model: Model) -> Self {
        Self {
            meta,
            model,
            resolver: None,
            config: Arc::new(EngineConfig::default()),
        }
    }

    /// Attaches the registry used to resolve foreign references. Without
    /// one, foreign fields keep their raw reference values.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<DataApiRegistry>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Arc<EngineConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn meta(&self) -> &DataApiMeta {
        &self.meta
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Runs a named endpoint: its guards first, in declaration order,
    /// then the operation itself. Parameters arrive as one JSON object
    /// per the shapes of the `*Params` structs.
    pub async fn dispatch(
        &self,
        endpoint: &str,
        ctx: &RequestContext,
        params: Value,
    ) -> TidewireResult<Value> {
        let Some(definition) = self.meta.endpoint(endpoint) else {
            return Err(ApiError::UnknownEndpoint(format!(
                "`{}` on `{}`",
                endpoint,
                self.meta.entity()
            ))
            .into());
        };
        for guard in definition.guards() {
            guard.check(ctx, endpoint).await?;
        }
        match definition.operation() {
            Operation::Get => {
                let params: GetParams = decode_params(endpoint, params)?;
                self.get(ctx, params).await
            }
            Operation::List => {
                let params: ListParams = decode_params(endpoint, params)?;
                Ok(serde_json::to_value(self.list(ctx, params).await?)?)
            }
            Operation::New => {
                let params: NewParams = decode_params(endpoint, params)?;
                let report = self.create(ctx, params.body, params.no_mandatory).await?;
                Ok(serde_json::to_value(report)?)
            }
            Operation::Edit => {
                let params: EditParams = decode_params(endpoint, params)?;
                Ok(serde_json::to_value(self.edit(ctx, params).await?)?)
            }
            Operation::Delete => {
                let params: DeleteParams = decode_params(endpoint, params)?;
                Ok(serde_json::to_value(self.remove(params.id).await?)?)
            }
        }
    }

    /// Fetches one row, projects it to readable fields and resolves one
    /// level of foreign references.
    pub async fn get(&self, _ctx: &RequestContext, params: GetParams) -> TidewireResult<Value> {
        if params.id.is_null() {
            return Err(ApiError::Validation("missing `id`".to_string()).into());
        }
        let row = self
            .fetch(&params.id, params.index.as_deref())
            .await?
            .ok_or_else(|| self.not_found(&params.id))?;
        let mut shaped = project(&self.meta, &row, Projection::Readable);
        if !params.no_foreign {
            self.resolve_foreign(std::slice::from_mut(&mut shaped), Projection::Readable)
                .await?;
        }
        Ok(shaped)
    }

    /// Lists rows through the declared filters and sorts, paginated and
    /// projected to the listable field set.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        params: ListParams,
    ) -> TidewireResult<ListResult> {
        let cap = params
            .max_page
            .unwrap_or(self.config.max_page)
            .min(self.config.max_page)
            .max(1);
        let limit = params.limit.unwrap_or(self.config.default_page).clamp(1, cap);
        let offset = params.offset;

        let sort = self.sort_plan(params.sort_key.as_deref(), params.sort_direction.as_deref())?;
        let mut chain = self.model.query();

        // Index-backed ordering only applies to the table selection, so it
        // must precede any filter step.
        if let Some((field, direction, Sortable::Indexed)) = &sort {
            self.model.descriptor().index(field)?;
            chain = chain.order_by_index(field, *direction);
        }
        chain = self.apply_filters(chain, ctx, &params.filters)?;
        if let Some((field, direction, Sortable::Plain)) = &sort {
            chain = chain.order_by(field, *direction);
        }

        let total = count_of(self.model.run(chain.clone().count()).await?)?;

        if offset > 0 {
            chain = chain.skip(offset);
        }
        chain = chain.limit(limit);

        let mode = params.pluck_mode.unwrap_or(PluckMode::Listable);
        let projection = match mode {
            PluckMode::Listable => Projection::Listable,
            PluckMode::Readable => Projection::Readable,
        };
        if !params.no_pluck {
            let fields = self.pluck_set(mode);
            let names: Vec<&str> = fields.iter().map(String::as_str).collect();
            chain = chain.pluck(&names);
        }

        let rows = rows_of(self.model.run(chain).await?)?;
        let mut results: Vec<Value> = if params.no_pluck {
            rows
        } else {
            rows.iter()
                .map(|row| project(&self.meta, row, projection))
                .collect()
        };
        if !params.no_pluck && !params.no_foreign {
            self.resolve_foreign(&mut results, projection).await?;
        }

        Ok(ListResult {
            results,
            total,
            offset,
            limit,
        })
    }

    /// Inserts one row from caller-supplied plain data.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        body: Value,
        no_mandatory: bool,
    ) -> TidewireResult<WriteReport> {
        let body = expect_body(body)?;
        if !no_mandatory {
            self.check_mandatory("new", &body)?;
        }
        let row = self.sanitize(&body)?;
        self.model
            .insert_with_args(vec![Value::Object(row)], Conflict::Error, &ctx.modifier_args())
            .await
    }

    /// Patches one existing row. The row must exist; the patch passes the
    /// same mandatory and sanitization pipeline as New.
    pub async fn edit(&self, ctx: &RequestContext, params: EditParams) -> TidewireResult<WriteReport> {
        if params.id.is_null() {
            return Err(ApiError::Validation("missing `id`".to_string()).into());
        }
        let body = expect_body(params.body)?;
        let existing = self
            .fetch(&params.id, params.index.as_deref())
            .await?
            .ok_or_else(|| self.not_found(&params.id))?;
        if !params.no_mandatory {
            self.check_mandatory("edit", &body)?;
        }
        let patch = self.sanitize(&body)?;
        let key = existing
            .get(self.model.descriptor().primary_key())
            .cloned()
            .unwrap_or(params.id);
        self.model
            .update_with_args(key, Value::Object(patch), &ctx.modifier_args())
            .await
    }

    /// Deletes the rows with the given primary keys.
    pub async fn remove(&self, ids: Vec<Value>) -> TidewireResult<WriteReport> {
        self.model.delete_many(ids).await
    }

    async fn fetch(&self, id: &Value, index: Option<&str>) -> TidewireResult<Option<Value>> {
        match index {
            None => self.model.get(id.clone()).await,
            Some(index) => Ok(self
                .model
                .get_by(index, vec![id.clone()])
                .await?
                .into_iter()
                .next()),
        }
    }

    fn not_found(&self, id: &Value) -> TidewireError {
        let shown = id
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string());
        ApiError::NotFound(format!("{} `{}`", self.meta.entity(), shown)).into()
    }

    fn sort_plan(
        &self,
        sort_key: Option<&str>,
        direction: Option<&str>,
    ) -> TidewireResult<Option<(String, Direction, Sortable)>> {
        let Some(sort_key) = sort_key else {
            return Ok(None);
        };
        let meta = self
            .meta
            .field(sort_key)
            .ok_or_else(|| ApiError::Validation(format!("unknown sort field `{}`", sort_key)))?;
        let direction = match direction {
            None | Some("asc") => Direction::Asc,
            Some("desc") => Direction::Desc,
            Some(other) => {
                return Err(
                    ApiError::Validation(format!("unknown sort direction `{}`", other)).into(),
                )
            }
        };
        match meta.sortable() {
            Sortable::No => {
                Err(ApiError::Validation(format!("field `{}` is not sortable", sort_key)).into())
            }
            mode => Ok(Some((meta.db_name().to_string(), direction, mode))),
        }
    }

    fn apply_filters(
        &self,
        mut chain: QueryBuilder,
        ctx: &RequestContext,
        filters: &BTreeMap<String, Value>,
    ) -> TidewireResult<QueryBuilder> {
        for (name, param) in filters {
            let builder = self
                .meta
                .filter(name)
                .ok_or_else(|| ApiError::Validation(format!("unknown filter `{}`", name)))?;
            let (value, op) = parse_filter_param(param)?;
            let field = self
                .meta
                .field(name)
                .map(|meta| meta.db_name().to_string())
                .unwrap_or_else(|| name.clone());
            let capture = RowCapture::begin();
            let predicate = builder.build(ctx, capture.row(), &field, &value, op)?;
            chain = chain.filter_arg(capture.finish(predicate));
        }
        Ok(chain)
    }

    /// Stored fields the engine must return for a list page: the primary
    /// key, every included field's column, and the raw columns computed
    /// fields declare they need.
    fn pluck_set(&self, mode: PluckMode) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        fields.insert(self.model.descriptor().primary_key().to_string());
        for (_, meta) in self.meta.fields() {
            if !meta.is_readable() {
                continue;
            }
            let included = match mode {
                PluckMode::Listable => meta.listable().is_listed(),
                PluckMode::Readable => true,
            };
            if !included {
                continue;
            }
            if let Listable::WithFields(raw) = meta.listable() {
                fields.extend(raw.iter().cloned());
            }
            if meta.computed().is_none() {
                fields.insert(meta.db_name().to_string());
            }
        }
        fields
    }

    /// Replaces foreign-reference values in already projected rows with
    /// the referenced rows, projected through their own entity metadata.
    /// Resolution is one level deep; targets keep raw references. Loads
    /// are batched per field across the whole page. References that do
    /// not resolve keep their raw value.
    async fn resolve_foreign(
        &self,
        rows: &mut [Value],
        projection: Projection,
    ) -> TidewireResult<()> {
        let Some(resolver) = &self.resolver else {
            return Ok(());
        };
        let foreign_fields: Vec<_> = self
            .meta
            .fields()
            .filter(|(_, meta)| {
                meta.is_readable()
                    && (projection == Projection::Readable || meta.listable().is_listed())
            })
            .filter_map(|(key, meta)| {
                meta.foreign()
                    .map(|foreign| (key.to_string(), foreign.clone()))
            })
            .collect();

        for (key, foreign) in foreign_fields {
            let Some(entry) = resolver.resolve(&foreign.table) else {
                log::warn!("foreign target `{}` is not registered", foreign.table);
                continue;
            };

            let mut seen = BTreeSet::new();
            let mut keys = Vec::new();
            for row in rows.iter() {
                let Some(value) = row.get(&key) else { continue };
                for reference in ref_values(value, foreign.multi) {
                    if seen.insert(reference.to_string()) {
                        keys.push(reference);
                    }
                }
            }
            if keys.is_empty() {
                continue;
            }

            let (target_field, targets) = fetch_targets(&entry, &foreign.index, keys).await?;
            let mut by_reference: BTreeMap<String, Value> = BTreeMap::new();
            for target in targets {
                let reference = target.get(&target_field).cloned().unwrap_or(Value::Null);
                by_reference.insert(
                    reference.to_string(),
                    project(&entry.meta, &target, projection),
                );
            }

            for row in rows.iter_mut() {
                let Some(object) = row.as_object_mut() else { continue };
                let Some(value) = object.get(&key).cloned() else {
                    continue;
                };
                let resolved = if foreign.multi {
                    Value::Array(
                        ref_values(&value, true)
                            .into_iter()
                            .map(|reference| {
                                by_reference
                                    .get(&reference.to_string())
                                    .cloned()
                                    .unwrap_or(reference)
                            })
                            .collect(),
                    )
                } else {
                    by_reference
                        .get(&value.to_string())
                        .cloned()
                        .unwrap_or(value)
                };
                object.insert(key.clone(), resolved);
            }
        }
        Ok(())
    }

    fn check_mandatory(&self, verb: &str, body: &Map<String, Value>) -> ApiResult<()> {
        let missing: Vec<&str> = self
            .meta
            .fields()
            .filter(|(key, meta)| {
                meta.is_mandatory_for(verb) && !body.get(*key).map(present).unwrap_or(false)
            })
            .map(|(key, _)| key)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(format!(
                "missing mandatory fields for `{}`: {}",
                verb,
                missing.join(", ")
            )))
        }
    }

    /// Drops undeclared and non-writable fields, runs validators, and
    /// renames surviving keys to their stored names.
    fn sanitize(&self, body: &Map<String, Value>) -> TidewireResult<Map<String, Value>> {
        let mut row = Map::new();
        for (key, value) in body {
            let Some(meta) = self.meta.field(key) else {
                log::debug!(
                    "dropping undeclared field `{}` on `{}`",
                    key,
                    self.meta.entity()
                );
                continue;
            };
            if !meta.is_writable() {
                log::debug!("dropping non-writable field `{}`", key);
                continue;
            }
            for validator in meta.validators() {
                validator
                    .validate(key, value)
                    .map_err(ApiError::Validation)?;
            }
            row.insert(meta.db_name().to_string(), value.clone());
        }
        Ok(row)
    }
}

impl std::fmt::Debug for DataApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataApi")
            .field("entity", &self.meta.entity())
            .field("table", &self.model.descriptor().table())
            .finish()
    }
}

/// Shapes one raw row through entity metadata: readable fields only,
/// computed getters evaluated against the raw row, keys renamed from
/// stored to declared names.
fn project(meta: &DataApiMeta, row: &Value, projection: Projection) -> Value {
    let mut out = Map::new();
    for (key, field) in meta.fields() {
        if !field.is_readable() {
            continue;
        }
        if projection == Projection::Listable && !field.listable().is_listed() {
            continue;
        }
        let value = match field.computed() {
            Some(compute) => compute(row),
            None => match row.get(field.db_name()) {
                Some(value) => value.clone(),
                None => continue,
            },
        };
        out.insert(key.to_string(), value);
    }
    Value::Object(out)
}

async fn fetch_targets(
    entry: &ApiEntry,
    index: &str,
    keys: Vec<Value>,
) -> TidewireResult<(String, Vec<Value>)> {
    let primary = entry.model.descriptor().primary_key().to_string();
    if index == primary {
        let targets = entry.model.get_many(keys).await?;
        Ok((primary, targets))
    } else {
        let field = entry
            .model
            .descriptor()
            .index(index)?
            .fields
            .first()
            .cloned()
            .unwrap_or_else(|| index.to_string());
        let targets = entry.model.get_by(index, keys).await?;
        Ok((field, targets))
    }
}

fn ref_values(value: &Value, multi: bool) -> Vec<Value> {
    if multi {
        value.as_array().cloned().unwrap_or_default()
    } else if value.is_null() {
        Vec::new()
    } else {
        vec![value.clone()]
    }
}

fn present(value: &Value) -> bool {
    !value.is_null()
}

fn expect_body(body: Value) -> ApiResult<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(ApiError::Validation(format!(
            "body must be an object, got {}",
            other
        ))),
    }
}

fn decode_params<T: serde::de::DeserializeOwned>(endpoint: &str, params: Value) -> TidewireResult<T> {
    serde_json::from_value(params).map_err(|err| {
        ApiError::Validation(format!("invalid `{}` parameters: {}", endpoint, err)).into()
    })
}

fn rows_of(value: Value) -> TidewireResult<Vec<Value>> {
    match value {
        Value::Array(rows) => Ok(rows),
        other => Err(ProtocolError::Malformed(format!(
            "expected an array of rows, got {}",
            other
        ))
        .into()),
    }
}

fn count_of(value: Value) -> TidewireResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| ProtocolError::Malformed(format!("expected a count, got {}", value)).into())
}
