//! # In-Memory Mock Engine
//!
//! A reference executor that interprets query contexts against plain maps.
//! It exists so the full stack, from proxy capture to data API endpoints,
//! can run in tests without a remote engine. The interpreter covers the
//! pipeline operations the data layer emits: selections, filters,
//! projections, ordering, pagination, writes with conflict policies, and
//! whole-table change feeds.

use super::{CursorStep, ProtocolError, ProtocolResult, QueryExecutor};
use crate::ir::{QueryArg, QueryContext, QueryStep};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

const FEED_CAPACITY: usize = 256;

struct TableData {
    primary_key: String,
    rows: BTreeMap<String, Value>,
    indexes: BTreeMap<String, Vec<String>>,
    feed: broadcast::Sender<Value>,
}

impl TableData {
    fn new(primary_key: String) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        TableData {
            primary_key,
            rows: BTreeMap::new(),
            indexes: BTreeMap::new(),
            feed,
        }
    }

    fn emit(&self, old_val: Value, new_val: Value) {
        let _ = self.feed.send(json!({ "old_val": old_val, "new_val": new_val }));
    }
}

struct FeedCursor {
    rx: broadcast::Receiver<Value>,
    closed: Arc<Notify>,
}

enum CursorState {
    Buffered(VecDeque<Value>),
    Feed(FeedCursor),
    /// The receiver is checked out by an in-flight read; the notify handle
    /// lets close interrupt it.
    FeedBusy(Arc<Notify>),
}

#[derive(Default)]
struct EngineState {
    namespaces: HashMap<String, HashMap<String, TableData>>,
    cursors: HashMap<u64, CursorState>,
}

/// In-memory query engine keyed by (namespace, table).
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        MockEngine {
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    /// Snapshot of a table's rows, for assertions in tests.
    pub async fn table_rows(&self, schema: &str, table: &str) -> Vec<Value> {
        let state = self.state.lock().await;
        state
            .namespaces
            .get(schema)
            .and_then(|ns| ns.get(table))
            .map(|data| data.rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueryExecutor for MockEngine {
    async fn run_query(&self, ctx: &QueryContext) -> ProtocolResult<Value> {
        if ctx.last_id() == Some("changes") {
            return Err(ProtocolError::Malformed(
                "change feeds must be consumed through a cursor".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        let flow = execute(&mut state, ctx)?;
        flow_to_value(&state, flow)
    }

    async fn read_cursor(&self, request_id: u64, ctx: &QueryContext) -> ProtocolResult<CursorStep> {
        enum Action {
            Serve(CursorStep),
            AwaitFeed(FeedCursor),
        }

        let action = {
            let mut state = self.state.lock().await;
            match state.cursors.remove(&request_id) {
                None => {
                    if ctx.last_id() == Some("changes") {
                        let feed = subscribe(&mut state, ctx)?;
                        state
                            .cursors
                            .insert(request_id, CursorState::FeedBusy(feed.closed.clone()));
                        Action::AwaitFeed(feed)
                    } else {
                        let flow = execute(&mut state, ctx)?;
                        let items = flow_to_items(&state, flow)?;
                        let mut buffer = VecDeque::from(items);
                        let step = next_buffered(&mut buffer);
                        state.cursors.insert(request_id, CursorState::Buffered(buffer));
                        Action::Serve(step)
                    }
                }
                Some(CursorState::Buffered(mut buffer)) => {
                    let step = next_buffered(&mut buffer);
                    state.cursors.insert(request_id, CursorState::Buffered(buffer));
                    Action::Serve(step)
                }
                Some(CursorState::Feed(feed)) => {
                    state
                        .cursors
                        .insert(request_id, CursorState::FeedBusy(feed.closed.clone()));
                    Action::AwaitFeed(feed)
                }
                Some(busy @ CursorState::FeedBusy(_)) => {
                    state.cursors.insert(request_id, busy);
                    return Err(ProtocolError::Malformed(format!(
                        "concurrent read on cursor {}",
                        request_id
                    )));
                }
            }
        };

        match action {
            Action::Serve(step) => Ok(step),
            Action::AwaitFeed(mut feed) => {
                let item = loop {
                    tokio::select! {
                        event = feed.rx.recv() => match event {
                            Ok(value) => break Some(value),
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                log::warn!(
                                    "change feed cursor {} lagged, skipped {} events",
                                    request_id,
                                    missed
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => break None,
                        },
                        _ = feed.closed.notified() => break None,
                    }
                };
                let mut state = self.state.lock().await;
                let still_open =
                    matches!(state.cursors.get(&request_id), Some(CursorState::FeedBusy(_)));
                if !still_open {
                    return Ok(CursorStep::finished());
                }
                match item {
                    Some(value) => {
                        state.cursors.insert(request_id, CursorState::Feed(feed));
                        Ok(CursorStep::item(value))
                    }
                    None => {
                        state.cursors.remove(&request_id);
                        Ok(CursorStep::finished())
                    }
                }
            }
        }
    }

    async fn close_cursor(&self, request_id: u64) -> ProtocolResult<()> {
        let mut state = self.state.lock().await;
        if let Some(CursorState::FeedBusy(notify)) = state.cursors.remove(&request_id) {
            notify.notify_one();
        }
        Ok(())
    }
}

fn next_buffered(buffer: &mut VecDeque<Value>) -> CursorStep {
    match buffer.pop_front() {
        Some(value) => CursorStep::item(value),
        None => CursorStep::finished(),
    }
}

fn subscribe(state: &mut EngineState, ctx: &QueryContext) -> ProtocolResult<FeedCursor> {
    let steps = &ctx.steps;
    if steps.len() != 3 || steps[0].id != "db" || steps[1].id != "table" {
        return Err(ProtocolError::Unsupported(
            "changes over derived selections".to_string(),
        ));
    }
    let schema = string_arg(&steps[0], 0)?;
    let table = string_arg(&steps[1], 0)?;
    let data = lookup_table(state, &schema, &table)?;
    Ok(FeedCursor {
        rx: data.feed.subscribe(),
        closed: Arc::new(Notify::new()),
    })
}

enum Flow {
    Start,
    Db(String),
    Selection(Selection),
    Row {
        schema: String,
        table: String,
        key: Option<String>,
    },
    Rows(Vec<Value>),
    Scalar(Value),
}

struct Selection {
    schema: String,
    table: String,
    /// Canonical primary keys in selection order; `None` selects the whole
    /// table.
    keys: Option<Vec<String>>,
}

fn execute(state: &mut EngineState, ctx: &QueryContext) -> ProtocolResult<Flow> {
    let mut flow = Flow::Start;
    for step in &ctx.steps {
        flow = apply_step(state, flow, step)?;
    }
    Ok(flow)
}

fn flow_to_value(state: &EngineState, flow: Flow) -> ProtocolResult<Value> {
    match flow {
        Flow::Scalar(value) => Ok(value),
        Flow::Rows(rows) => Ok(Value::Array(rows)),
        Flow::Selection(sel) => Ok(Value::Array(selection_rows(state, &sel)?)),
        Flow::Row { schema, table, key } => {
            let data = lookup_table(state, &schema, &table)?;
            Ok(key
                .and_then(|k| data.rows.get(&k).cloned())
                .unwrap_or(Value::Null))
        }
        Flow::Start | Flow::Db(_) => {
            Err(ProtocolError::Malformed("incomplete query".to_string()))
        }
    }
}

fn flow_to_items(state: &EngineState, flow: Flow) -> ProtocolResult<Vec<Value>> {
    match flow {
        Flow::Rows(rows) => Ok(rows),
        Flow::Selection(sel) => selection_rows(state, &sel),
        Flow::Row { schema, table, key } => {
            let data = lookup_table(state, &schema, &table)?;
            Ok(key
                .and_then(|k| data.rows.get(&k).cloned())
                .into_iter()
                .collect())
        }
        Flow::Scalar(value) => Ok(vec![value]),
        Flow::Start | Flow::Db(_) => {
            Err(ProtocolError::Malformed("incomplete query".to_string()))
        }
    }
}

fn apply_step(state: &mut EngineState, flow: Flow, step: &QueryStep) -> ProtocolResult<Flow> {
    match (flow, step.id.as_str()) {
        (Flow::Start, "db") => Ok(Flow::Db(string_arg(step, 0)?)),
        (Flow::Db(schema), "table") => {
            let table = string_arg(step, 0)?;
            lookup_table(state, &schema, &table)?;
            Ok(Flow::Selection(Selection {
                schema,
                table,
                keys: None,
            }))
        }
        (Flow::Db(schema), "table_create") => {
            let table = string_arg(step, 0)?;
            let primary_key = step
                .opt("primary_key")
                .and_then(Value::as_str)
                .unwrap_or("id")
                .to_string();
            let namespace = state.namespaces.entry(schema).or_default();
            let created = if namespace.contains_key(&table) {
                0
            } else {
                namespace.insert(table.clone(), TableData::new(primary_key));
                log::info!("mock engine created table '{}'", table);
                1
            };
            Ok(Flow::Scalar(json!({ "tables_created": created })))
        }
        (Flow::Selection(sel), "index_create") => {
            if sel.keys.is_some() {
                return Err(ProtocolError::Malformed(
                    "index_create requires a table".to_string(),
                ));
            }
            let name = string_arg(step, 0)?;
            let fields = string_list_arg(step, 1)?;
            let data = lookup_table_mut(state, &sel.schema, &sel.table)?;
            let created = if data.indexes.contains_key(&name) { 0 } else { 1 };
            data.indexes.insert(name, fields);
            Ok(Flow::Scalar(json!({ "created": created })))
        }
        (Flow::Selection(sel), "get") => {
            let key = canonical_key(&eval_arg(arg_at(step, 0)?, &HashMap::new())?);
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let key = data.rows.contains_key(&key).then_some(key);
            Ok(Flow::Row {
                schema: sel.schema,
                table: sel.table,
                key,
            })
        }
        (Flow::Selection(sel), "get_all") => {
            let mut wanted = Vec::new();
            for arg in &step.args {
                wanted.push(eval_arg(arg, &HashMap::new())?);
            }
            let index = step.opt("index").and_then(Value::as_str);
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let mut keys = Vec::new();
            match index {
                None => {
                    for value in &wanted {
                        let key = canonical_key(value);
                        if data.rows.contains_key(&key) && !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
                Some(index) => {
                    let fields = index_fields(data, &sel.table, index)?;
                    for (key, row) in &data.rows {
                        let indexed = index_value(row, &fields);
                        if wanted.iter().any(|w| json_cmp(w, &indexed) == Ordering::Equal)
                            && !keys.contains(key)
                        {
                            keys.push(key.clone());
                        }
                    }
                }
            }
            Ok(Flow::Selection(Selection {
                schema: sel.schema,
                table: sel.table,
                keys: Some(keys),
            }))
        }
        (Flow::Selection(sel), "between") => {
            let lower = eval_arg(arg_at(step, 0)?, &HashMap::new())?;
            let upper = eval_arg(arg_at(step, 1)?, &HashMap::new())?;
            let index = step.opt("index").and_then(Value::as_str);
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let fields = match index {
                Some(index) => index_fields(data, &sel.table, index)?,
                None => vec![data.primary_key.clone()],
            };
            let mut matched: Vec<(Value, String)> = Vec::new();
            for key in existing_keys(data, &sel.keys) {
                if let Some(row) = data.rows.get(&key) {
                    let value = index_value(row, &fields);
                    if json_cmp(&value, &lower) != Ordering::Less
                        && json_cmp(&value, &upper) == Ordering::Less
                    {
                        matched.push((value, key));
                    }
                }
            }
            matched.sort_by(|a, b| json_cmp(&a.0, &b.0));
            Ok(Flow::Selection(Selection {
                schema: sel.schema,
                table: sel.table,
                keys: Some(matched.into_iter().map(|(_, key)| key).collect()),
            }))
        }
        (Flow::Selection(sel), "filter") => {
            let (vars, body) = func_arg(step, 0)?;
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let mut keys = Vec::new();
            for key in existing_keys(data, &sel.keys) {
                if let Some(row) = data.rows.get(&key) {
                    if truthy(&apply_func(vars, body, &[row.clone()])?) {
                        keys.push(key);
                    }
                }
            }
            Ok(Flow::Selection(Selection {
                schema: sel.schema,
                table: sel.table,
                keys: Some(keys),
            }))
        }
        (Flow::Rows(rows), "filter") => {
            let (vars, body) = func_arg(step, 0)?;
            let mut kept = Vec::new();
            for row in rows {
                if truthy(&apply_func(vars, body, &[row.clone()])?) {
                    kept.push(row);
                }
            }
            Ok(Flow::Rows(kept))
        }
        (flow @ (Flow::Selection(_) | Flow::Rows(_)), "map") => {
            let (vars, body) = func_arg(step, 0)?;
            let rows = materialize(state, flow)?;
            let mut mapped = Vec::new();
            for row in rows {
                mapped.push(apply_func(vars, body, &[row])?);
            }
            Ok(Flow::Rows(mapped))
        }
        (Flow::Selection(sel), "order_by") => {
            let (fields, descending) = order_spec(state, &sel, step)?;
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let mut entries: Vec<(Value, String)> = existing_keys(data, &sel.keys)
                .into_iter()
                .filter_map(|key| {
                    data.rows
                        .get(&key)
                        .map(|row| (index_value(row, &fields), key))
                })
                .collect();
            entries.sort_by(|a, b| json_cmp(&a.0, &b.0));
            if descending {
                entries.reverse();
            }
            Ok(Flow::Selection(Selection {
                schema: sel.schema,
                table: sel.table,
                keys: Some(entries.into_iter().map(|(_, key)| key).collect()),
            }))
        }
        (Flow::Rows(mut rows), "order_by") => {
            let field = string_arg(step, 0)?;
            let descending = step.opt("direction").and_then(Value::as_str) == Some("desc");
            rows.sort_by(|a, b| json_cmp(&field_of(a, &field), &field_of(b, &field)));
            if descending {
                rows.reverse();
            }
            Ok(Flow::Rows(rows))
        }
        (Flow::Selection(sel), "skip") => {
            let count = usize_arg(step, 0)?;
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let keys = existing_keys(data, &sel.keys).into_iter().skip(count).collect();
            Ok(Flow::Selection(Selection {
                schema: sel.schema,
                table: sel.table,
                keys: Some(keys),
            }))
        }
        (Flow::Rows(rows), "skip") => {
            let count = usize_arg(step, 0)?;
            Ok(Flow::Rows(rows.into_iter().skip(count).collect()))
        }
        (Flow::Selection(sel), "limit") => {
            let count = usize_arg(step, 0)?;
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let keys = existing_keys(data, &sel.keys).into_iter().take(count).collect();
            Ok(Flow::Selection(Selection {
                schema: sel.schema,
                table: sel.table,
                keys: Some(keys),
            }))
        }
        (Flow::Rows(rows), "limit") => {
            let count = usize_arg(step, 0)?;
            Ok(Flow::Rows(rows.into_iter().take(count).collect()))
        }
        (flow @ (Flow::Selection(_) | Flow::Rows(_)), "count") => {
            let rows = materialize(state, flow)?;
            Ok(Flow::Scalar(json!(rows.len())))
        }
        (flow @ (Flow::Selection(_) | Flow::Rows(_)), "pluck") => {
            let fields = string_list_arg(step, 0)?;
            let rows = materialize(state, flow)?;
            Ok(Flow::Rows(
                rows.iter().map(|row| pluck_fields(row, &fields)).collect(),
            ))
        }
        (Flow::Row { schema, table, key }, "pluck") => {
            let fields = string_list_arg(step, 0)?;
            let data = lookup_table(state, &schema, &table)?;
            let row = key.and_then(|k| data.rows.get(&k).cloned());
            Ok(Flow::Scalar(
                row.map(|r| pluck_fields(&r, &fields)).unwrap_or(Value::Null),
            ))
        }
        (flow @ (Flow::Selection(_) | Flow::Rows(_)), "without") => {
            let fields = string_list_arg(step, 0)?;
            let rows = materialize(state, flow)?;
            Ok(Flow::Rows(
                rows.iter().map(|row| without_fields(row, &fields)).collect(),
            ))
        }
        (Flow::Row { schema, table, key }, "without") => {
            let fields = string_list_arg(step, 0)?;
            let data = lookup_table(state, &schema, &table)?;
            let row = key.and_then(|k| data.rows.get(&k).cloned());
            Ok(Flow::Scalar(
                row.map(|r| without_fields(&r, &fields)).unwrap_or(Value::Null),
            ))
        }
        (flow @ (Flow::Selection(_) | Flow::Rows(_)), "group") => {
            let field = string_arg(step, 0)?;
            let rows = materialize(state, flow)?;
            let mut groups: BTreeMap<String, (Value, Vec<Value>)> = BTreeMap::new();
            for row in rows {
                let group = field_of(&row, &field);
                groups
                    .entry(canonical_key(&group))
                    .or_insert_with(|| (group, Vec::new()))
                    .1
                    .push(row);
            }
            Ok(Flow::Rows(
                groups
                    .into_values()
                    .map(|(group, reduction)| json!({ "group": group, "reduction": reduction }))
                    .collect(),
            ))
        }
        (flow @ (Flow::Selection(_) | Flow::Rows(_)), "eq_join") => {
            let field = string_arg(step, 0)?;
            let sub = query_arg(step, 1)?;
            let rows = materialize(state, flow)?;
            let right = join_target(state, sub)?;
            let mut joined = Vec::new();
            for left in rows {
                let key = canonical_key(&field_of(&left, &field));
                if let Some(right_row) = right.get(&key) {
                    joined.push(json!({ "left": left, "right": right_row }));
                }
            }
            Ok(Flow::Rows(joined))
        }
        (flow @ (Flow::Selection(_) | Flow::Rows(_)), "inner_join") => {
            let sub = query_arg(step, 0)?;
            let (vars, body) = func_arg(step, 1)?;
            let rows = materialize(state, flow)?;
            let right: Vec<Value> = join_target(state, sub)?.into_values().collect();
            let mut joined = Vec::new();
            for left in &rows {
                for right_row in &right {
                    if truthy(&apply_func(vars, body, &[left.clone(), right_row.clone()])?) {
                        joined.push(json!({ "left": left, "right": right_row }));
                    }
                }
            }
            Ok(Flow::Rows(joined))
        }
        (Flow::Selection(sel), "insert") => {
            if sel.keys.is_some() {
                return Err(ProtocolError::Malformed("insert requires a table".to_string()));
            }
            let rows = match arg_at(step, 0)? {
                QueryArg::Array { value } => {
                    let mut evaluated = Vec::new();
                    for arg in value {
                        evaluated.push(eval_arg(arg, &HashMap::new())?);
                    }
                    evaluated
                }
                other => vec![eval_arg(other, &HashMap::new())?],
            };
            let conflict = step
                .opt("conflict")
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string();
            let data = lookup_table_mut(state, &sel.schema, &sel.table)?;
            Ok(Flow::Scalar(insert_rows(data, rows, &conflict)))
        }
        (Flow::Selection(sel), "update") => {
            let data = lookup_table_mut(state, &sel.schema, &sel.table)?;
            let keys = existing_keys(data, &sel.keys);
            update_rows(data, keys, step)
        }
        (Flow::Row { schema, table, key }, "update") => {
            let data = lookup_table_mut(state, &schema, &table)?;
            update_rows(data, key.into_iter().collect(), step)
        }
        (Flow::Selection(sel), "delete") => {
            let data = lookup_table_mut(state, &sel.schema, &sel.table)?;
            let keys = existing_keys(data, &sel.keys);
            Ok(Flow::Scalar(delete_rows(data, keys)))
        }
        (Flow::Row { schema, table, key }, "delete") => {
            let data = lookup_table_mut(state, &schema, &table)?;
            Ok(Flow::Scalar(delete_rows(data, key.into_iter().collect())))
        }
        (_, "changes") => Err(ProtocolError::Malformed(
            "change feeds must be consumed through a cursor".to_string(),
        )),
        (_, id) => Err(ProtocolError::Unsupported(id.to_string())),
    }
}

fn insert_rows(data: &mut TableData, rows: Vec<Value>, conflict: &str) -> Value {
    let mut report = Report::default();
    for row in rows {
        let Value::Object(mut fields) = row else {
            report.row_error("inserted row is not an object".to_string());
            continue;
        };
        let key_value = match fields.get(&data.primary_key) {
            Some(value) => value.clone(),
            None => {
                let generated = Uuid::new_v4().to_string();
                fields.insert(data.primary_key.clone(), json!(generated));
                report.generated_keys.push(generated.clone());
                json!(generated)
            }
        };
        let key = canonical_key(&key_value);
        let row = Value::Object(fields);
        match data.rows.get(&key).cloned() {
            None => {
                data.rows.insert(key, row.clone());
                data.emit(Value::Null, row);
                report.inserted += 1;
            }
            Some(old) => match conflict {
                "replace" => {
                    data.rows.insert(key, row.clone());
                    data.emit(old, row);
                    report.replaced += 1;
                }
                "update" => {
                    let merged = deep_merge(&old, &row);
                    if merged != old {
                        data.rows.insert(key, merged.clone());
                        data.emit(old, merged);
                        report.replaced += 1;
                    }
                }
                _ => {
                    report.row_error(format!(
                        "duplicate primary key `{}` in table `{}`",
                        key_value, data.primary_key
                    ));
                }
            },
        }
    }
    report.into_value()
}

fn update_rows(
    data: &mut TableData,
    keys: Vec<String>,
    step: &QueryStep,
) -> ProtocolResult<Flow> {
    let mut report = Report::default();
    let patch_arg = arg_at(step, 0)?;
    for key in keys {
        let Some(old) = data.rows.get(&key).cloned() else {
            continue;
        };
        let patch = match patch_arg {
            QueryArg::Func { vars, value } => apply_func(vars, value, &[old.clone()])?,
            other => eval_arg(other, &HashMap::new())?,
        };
        if !patch.is_object() {
            report.row_error("update patch is not an object".to_string());
            continue;
        }
        let merged = deep_merge(&old, &patch);
        let pk = &data.primary_key;
        if field_of(&merged, pk) != field_of(&old, pk) {
            report.row_error(format!("primary key `{}` cannot be changed", pk));
            continue;
        }
        if merged != old {
            data.rows.insert(key, merged.clone());
            data.emit(old, merged);
            report.replaced += 1;
        }
    }
    Ok(Flow::Scalar(report.into_value()))
}

fn delete_rows(data: &mut TableData, keys: Vec<String>) -> Value {
    let mut report = Report::default();
    for key in keys {
        if let Some(old) = data.rows.remove(&key) {
            data.emit(old, Value::Null);
            report.deleted += 1;
        }
    }
    report.into_value()
}

#[derive(Default)]
struct Report {
    inserted: u64,
    replaced: u64,
    deleted: u64,
    errors: u64,
    first_error: Option<String>,
    generated_keys: Vec<String>,
}

impl Report {
    fn row_error(&mut self, message: String) {
        self.errors += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }

    fn into_value(self) -> Value {
        let mut out = Map::new();
        out.insert("inserted".to_string(), json!(self.inserted));
        out.insert("replaced".to_string(), json!(self.replaced));
        out.insert("deleted".to_string(), json!(self.deleted));
        out.insert("errors".to_string(), json!(self.errors));
        if let Some(first_error) = self.first_error {
            out.insert("first_error".to_string(), json!(first_error));
        }
        if !self.generated_keys.is_empty() {
            out.insert("generated_keys".to_string(), json!(self.generated_keys));
        }
        Value::Object(out)
    }
}

fn join_target(
    state: &mut EngineState,
    sub: &[QueryStep],
) -> ProtocolResult<BTreeMap<String, Value>> {
    let flow = execute(state, &QueryContext::new(sub.to_vec()))?;
    match flow {
        Flow::Selection(sel) => {
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            let mut rows = BTreeMap::new();
            for key in existing_keys(data, &sel.keys) {
                if let Some(row) = data.rows.get(&key) {
                    rows.insert(key, row.clone());
                }
            }
            Ok(rows)
        }
        _ => Err(ProtocolError::Malformed(
            "join target must be a table selection".to_string(),
        )),
    }
}

fn materialize(state: &EngineState, flow: Flow) -> ProtocolResult<Vec<Value>> {
    match flow {
        Flow::Selection(sel) => selection_rows(state, &sel),
        Flow::Rows(rows) => Ok(rows),
        _ => Err(ProtocolError::Malformed(
            "operation requires a row sequence".to_string(),
        )),
    }
}

fn selection_rows(state: &EngineState, sel: &Selection) -> ProtocolResult<Vec<Value>> {
    let data = lookup_table(state, &sel.schema, &sel.table)?;
    Ok(existing_keys(data, &sel.keys)
        .into_iter()
        .filter_map(|key| data.rows.get(&key).cloned())
        .collect())
}

fn existing_keys(data: &TableData, keys: &Option<Vec<String>>) -> Vec<String> {
    match keys {
        Some(keys) => keys.clone(),
        None => data.rows.keys().cloned().collect(),
    }
}

fn lookup_table<'a>(
    state: &'a EngineState,
    schema: &str,
    table: &str,
) -> ProtocolResult<&'a TableData> {
    state
        .namespaces
        .get(schema)
        .and_then(|ns| ns.get(table))
        .ok_or_else(|| {
            ProtocolError::Evaluation(format!("table `{}.{}` does not exist", schema, table))
        })
}

fn lookup_table_mut<'a>(
    state: &'a mut EngineState,
    schema: &str,
    table: &str,
) -> ProtocolResult<&'a mut TableData> {
    state
        .namespaces
        .get_mut(schema)
        .and_then(|ns| ns.get_mut(table))
        .ok_or_else(|| {
            ProtocolError::Evaluation(format!("table `{}.{}` does not exist", schema, table))
        })
}

fn index_fields(data: &TableData, table: &str, index: &str) -> ProtocolResult<Vec<String>> {
    data.indexes.get(index).cloned().ok_or_else(|| {
        ProtocolError::Evaluation(format!("index `{}` does not exist on `{}`", index, table))
    })
}

fn index_value(row: &Value, fields: &[String]) -> Value {
    if fields.len() == 1 {
        field_of(row, &fields[0])
    } else {
        Value::Array(fields.iter().map(|f| field_of(row, f)).collect())
    }
}

fn order_spec(
    state: &EngineState,
    sel: &Selection,
    step: &QueryStep,
) -> ProtocolResult<(Vec<String>, bool)> {
    let descending = step.opt("direction").and_then(Value::as_str) == Some("desc");
    let fields = match step.opt("index").and_then(Value::as_str) {
        Some(index) => {
            let data = lookup_table(state, &sel.schema, &sel.table)?;
            index_fields(data, &sel.table, index)?
        }
        None => vec![string_arg(step, 0)?],
    };
    Ok((fields, descending))
}

fn field_of(row: &Value, field: &str) -> Value {
    row.get(field).cloned().unwrap_or(Value::Null)
}

fn pluck_fields(row: &Value, fields: &[String]) -> Value {
    let mut out = Map::new();
    if let Value::Object(source) = row {
        for field in fields {
            if let Some(value) = source.get(field) {
                out.insert(field.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

fn without_fields(row: &Value, fields: &[String]) -> Value {
    match row {
        Value::Object(source) => {
            let mut out = source.clone();
            for field in fields {
                out.remove(field);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn canonical_key(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

pub(crate) fn deep_merge(old: &Value, patch: &Value) -> Value {
    match (old, patch) {
        (Value::Object(old_fields), Value::Object(patch_fields)) => {
            let mut out = old_fields.clone();
            for (key, value) in patch_fields {
                let merged = match out.get(key) {
                    Some(previous) => deep_merge(previous, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => patch.clone(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: by type rank first, then within the type.
fn json_cmp(a: &Value, b: &Value) -> Ordering {
    let ranks = (type_rank(a), type_rank(b));
    if ranks.0 != ranks.1 {
        return ranks.0.cmp(&ranks.1);
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or_default();
            let yf = y.as_f64().unwrap_or_default();
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = json_cmp(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => canonical_key(a).cmp(&canonical_key(b)),
        _ => Ordering::Equal,
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn arg_at<'a>(step: &'a QueryStep, index: usize) -> ProtocolResult<&'a QueryArg> {
    step.args.get(index).ok_or_else(|| {
        ProtocolError::Malformed(format!("step `{}` is missing argument {}", step.id, index))
    })
}

fn string_arg(step: &QueryStep, index: usize) -> ProtocolResult<String> {
    match arg_at(step, index)? {
        QueryArg::Value {
            value: Value::String(s),
        } => Ok(s.clone()),
        _ => Err(ProtocolError::Malformed(format!(
            "step `{}` expects a string argument",
            step.id
        ))),
    }
}

fn usize_arg(step: &QueryStep, index: usize) -> ProtocolResult<usize> {
    match arg_at(step, index)? {
        QueryArg::Value { value } => value.as_u64().map(|n| n as usize).ok_or_else(|| {
            ProtocolError::Malformed(format!("step `{}` expects a count argument", step.id))
        }),
        _ => Err(ProtocolError::Malformed(format!(
            "step `{}` expects a count argument",
            step.id
        ))),
    }
}

fn string_list_arg(step: &QueryStep, index: usize) -> ProtocolResult<Vec<String>> {
    match arg_at(step, index)? {
        QueryArg::Array { value } => {
            let mut out = Vec::new();
            for arg in value {
                match arg {
                    QueryArg::Value {
                        value: Value::String(s),
                    } => out.push(s.clone()),
                    _ => {
                        return Err(ProtocolError::Malformed(format!(
                            "step `{}` expects a list of field names",
                            step.id
                        )))
                    }
                }
            }
            Ok(out)
        }
        _ => Err(ProtocolError::Malformed(format!(
            "step `{}` expects a list of field names",
            step.id
        ))),
    }
}

fn func_arg<'a>(step: &'a QueryStep, index: usize) -> ProtocolResult<(&'a [u32], &'a [QueryStep])> {
    match arg_at(step, index)? {
        QueryArg::Func { vars, value } => Ok((vars, value)),
        _ => Err(ProtocolError::Malformed(format!(
            "step `{}` expects a captured function",
            step.id
        ))),
    }
}

fn query_arg<'a>(step: &'a QueryStep, index: usize) -> ProtocolResult<&'a [QueryStep]> {
    match arg_at(step, index)? {
        QueryArg::Query { value, .. } => Ok(value),
        _ => Err(ProtocolError::Malformed(format!(
            "step `{}` expects a sub-query",
            step.id
        ))),
    }
}

fn apply_func(vars: &[u32], body: &[QueryStep], args: &[Value]) -> ProtocolResult<Value> {
    let mut env = HashMap::new();
    for (position, var) in vars.iter().enumerate() {
        env.insert(*var, args.get(position).cloned().unwrap_or(Value::Null));
    }
    eval_steps(body, &env)
}

fn eval_steps(steps: &[QueryStep], env: &HashMap<u32, Value>) -> ProtocolResult<Value> {
    let Some((first, rest)) = steps.split_first() else {
        return Err(ProtocolError::Malformed("empty expression".to_string()));
    };
    let mut acc = eval_first(first, env)?;
    for step in rest {
        acc = eval_op(acc, step, env)?;
    }
    Ok(acc)
}

fn eval_first(step: &QueryStep, env: &HashMap<u32, Value>) -> ProtocolResult<Value> {
    match step.id.as_str() {
        "datum" | "var" => eval_arg(arg_at(step, 0)?, env),
        "make_array" => {
            let mut out = Vec::new();
            for arg in &step.args {
                out.push(eval_arg(arg, env)?);
            }
            Ok(Value::Array(out))
        }
        "make_object" => eval_arg(arg_at(step, 0)?, env),
        id => Err(ProtocolError::Malformed(format!(
            "expression cannot start with `{}`",
            id
        ))),
    }
}

fn eval_arg(arg: &QueryArg, env: &HashMap<u32, Value>) -> ProtocolResult<Value> {
    match arg {
        QueryArg::Value { value } => Ok(value.clone()),
        QueryArg::Var { value } => env.get(value).cloned().ok_or_else(|| {
            ProtocolError::Malformed(format!("unbound variable {}", value))
        }),
        QueryArg::Array { value } => {
            let mut out = Vec::new();
            for arg in value {
                out.push(eval_arg(arg, env)?);
            }
            Ok(Value::Array(out))
        }
        QueryArg::Object { value } => {
            let mut out = Map::new();
            for (key, arg) in value {
                out.insert(key.clone(), eval_arg(arg, env)?);
            }
            Ok(Value::Object(out))
        }
        QueryArg::Query { query, value } if query == "sub" => eval_steps(value, env),
        QueryArg::Query { query, .. } => Err(ProtocolError::Unsupported(format!(
            "nested `{}` queries inside expressions",
            query
        ))),
        QueryArg::Func { .. } => Err(ProtocolError::Malformed(
            "bare function used as a value".to_string(),
        )),
    }
}

fn eval_op(acc: Value, step: &QueryStep, env: &HashMap<u32, Value>) -> ProtocolResult<Value> {
    match step.id.as_str() {
        "index" => {
            let key = string_arg(step, 0)?;
            match acc {
                Value::Object(fields) => Ok(fields.get(&key).cloned().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                other => Err(ProtocolError::Evaluation(format!(
                    "cannot index into {}",
                    type_name(&other)
                ))),
            }
        }
        "eq" => Ok(json!(json_cmp(&acc, &eval_arg(arg_at(step, 0)?, env)?) == Ordering::Equal)),
        "ne" => Ok(json!(json_cmp(&acc, &eval_arg(arg_at(step, 0)?, env)?) != Ordering::Equal)),
        "lt" => Ok(json!(json_cmp(&acc, &eval_arg(arg_at(step, 0)?, env)?) == Ordering::Less)),
        "le" => Ok(json!(json_cmp(&acc, &eval_arg(arg_at(step, 0)?, env)?) != Ordering::Greater)),
        "gt" => Ok(json!(json_cmp(&acc, &eval_arg(arg_at(step, 0)?, env)?) == Ordering::Greater)),
        "ge" => Ok(json!(json_cmp(&acc, &eval_arg(arg_at(step, 0)?, env)?) != Ordering::Less)),
        "and" => {
            let rhs = eval_arg(arg_at(step, 0)?, env)?;
            Ok(json!(truthy(&acc) && truthy(&rhs)))
        }
        "or" => {
            let rhs = eval_arg(arg_at(step, 0)?, env)?;
            Ok(json!(truthy(&acc) || truthy(&rhs)))
        }
        "not" => Ok(json!(!truthy(&acc))),
        "add" | "sub" | "mul" | "div" => {
            let rhs = eval_arg(arg_at(step, 0)?, env)?;
            numeric_op(step.id.as_str(), &acc, &rhs)
        }
        "add_secs" | "sub_secs" => {
            let seconds = eval_arg(arg_at(step, 0)?, env)?;
            let (Some(ms), Some(secs)) = (acc.as_i64(), seconds.as_f64()) else {
                return Err(ProtocolError::Evaluation(
                    "date arithmetic requires numbers".to_string(),
                ));
            };
            let shifted = ms as f64 + secs * 1000.0;
            Ok(json!(shifted as i64))
        }
        "epoch_ms" => match acc {
            Value::Number(_) => Ok(acc),
            other => Err(ProtocolError::Evaluation(format!(
                "cannot read epoch from {}",
                type_name(&other)
            ))),
        },
        "contains" => {
            let needle = eval_arg(arg_at(step, 0)?, env)?;
            match (&acc, &needle) {
                (Value::String(s), Value::String(n)) => Ok(json!(s.contains(n.as_str()))),
                (Value::Array(items), _) => Ok(json!(items
                    .iter()
                    .any(|item| json_cmp(item, &needle) == Ordering::Equal))),
                _ => Err(ProtocolError::Evaluation(format!(
                    "cannot test containment on {}",
                    type_name(&acc)
                ))),
            }
        }
        "concat" => {
            let rhs = eval_arg(arg_at(step, 0)?, env)?;
            match (acc, rhs) {
                (Value::String(a), Value::String(b)) => Ok(json!(format!("{}{}", a, b))),
                (Value::Array(mut a), Value::Array(b)) => {
                    a.extend(b);
                    Ok(Value::Array(a))
                }
                (a, _) => Err(ProtocolError::Evaluation(format!(
                    "cannot concat {}",
                    type_name(&a)
                ))),
            }
        }
        "starts_with" | "ends_with" => {
            let affix = eval_arg(arg_at(step, 0)?, env)?;
            let (Value::String(s), Value::String(a)) = (&acc, &affix) else {
                return Err(ProtocolError::Evaluation(
                    "affix tests require strings".to_string(),
                ));
            };
            Ok(json!(if step.id == "starts_with" {
                s.starts_with(a.as_str())
            } else {
                s.ends_with(a.as_str())
            }))
        }
        "match" => {
            let pattern = eval_arg(arg_at(step, 0)?, env)?;
            let (Value::String(s), Value::String(p)) = (&acc, &pattern) else {
                return Err(ProtocolError::Evaluation(
                    "match requires string input and pattern".to_string(),
                ));
            };
            let regex = Regex::new(p)
                .map_err(|e| ProtocolError::Evaluation(format!("invalid pattern: {}", e)))?;
            Ok(json!(regex.is_match(s)))
        }
        "upcase" => match acc {
            Value::String(s) => Ok(json!(s.to_uppercase())),
            other => Err(ProtocolError::Evaluation(format!(
                "cannot upcase {}",
                type_name(&other)
            ))),
        },
        "downcase" => match acc {
            Value::String(s) => Ok(json!(s.to_lowercase())),
            other => Err(ProtocolError::Evaluation(format!(
                "cannot downcase {}",
                type_name(&other)
            ))),
        },
        "count" => match acc {
            Value::Array(items) => Ok(json!(items.len())),
            Value::String(s) => Ok(json!(s.chars().count())),
            Value::Object(fields) => Ok(json!(fields.len())),
            other => Err(ProtocolError::Evaluation(format!(
                "cannot count {}",
                type_name(&other)
            ))),
        },
        "split" => {
            let separator = eval_arg(arg_at(step, 0)?, env)?;
            let (Value::String(s), Value::String(sep)) = (&acc, &separator) else {
                return Err(ProtocolError::Evaluation("split requires strings".to_string()));
            };
            Ok(json!(s.split(sep.as_str()).collect::<Vec<_>>()))
        }
        "nth" => {
            let Value::Array(items) = acc else {
                return Err(ProtocolError::Evaluation("nth requires an array".to_string()));
            };
            let index = eval_arg(arg_at(step, 0)?, env)?
                .as_i64()
                .ok_or_else(|| ProtocolError::Evaluation("nth requires an integer".to_string()))?;
            let resolved = if index < 0 {
                items.len() as i64 + index
            } else {
                index
            };
            items
                .get(resolved.max(0) as usize)
                .cloned()
                .ok_or_else(|| ProtocolError::Evaluation(format!("index {} out of range", index)))
        }
        "slice" => {
            let Value::Array(items) = acc else {
                return Err(ProtocolError::Evaluation("slice requires an array".to_string()));
            };
            let start = usize_arg(step, 0)?.min(items.len());
            let end = usize_arg(step, 1)?.min(items.len()).max(start);
            Ok(Value::Array(items[start..end].to_vec()))
        }
        "append" => {
            let Value::Array(mut items) = acc else {
                return Err(ProtocolError::Evaluation("append requires an array".to_string()));
            };
            items.push(eval_arg(arg_at(step, 0)?, env)?);
            Ok(Value::Array(items))
        }
        "map" | "filter" => {
            let Value::Array(items) = acc else {
                return Err(ProtocolError::Evaluation(format!(
                    "{} requires an array",
                    step.id
                )));
            };
            let (vars, body) = func_arg(step, 0)?;
            let mut out = Vec::new();
            for item in items {
                let mut child_env = env.clone();
                if let Some(var) = vars.first() {
                    child_env.insert(*var, item.clone());
                }
                let result = eval_steps(body, &child_env)?;
                if step.id == "map" {
                    out.push(result);
                } else if truthy(&result) {
                    out.push(item);
                }
            }
            Ok(Value::Array(out))
        }
        "has_field" => {
            let key = string_arg(step, 0)?;
            Ok(json!(acc.get(&key).map(|v| !v.is_null()).unwrap_or(false)))
        }
        "keys" => match acc {
            Value::Object(fields) => Ok(json!(fields.keys().collect::<Vec<_>>())),
            other => Err(ProtocolError::Evaluation(format!(
                "cannot list keys of {}",
                type_name(&other)
            ))),
        },
        "values" => match acc {
            Value::Object(fields) => Ok(Value::Array(fields.values().cloned().collect())),
            other => Err(ProtocolError::Evaluation(format!(
                "cannot list values of {}",
                type_name(&other)
            ))),
        },
        "merge" => {
            let rhs = eval_arg(arg_at(step, 0)?, env)?;
            Ok(deep_merge(&acc, &rhs))
        }
        "pluck" => {
            let fields = string_list_arg(step, 0)?;
            Ok(pluck_fields(&acc, &fields))
        }
        "without" => {
            let fields = string_list_arg(step, 0)?;
            Ok(without_fields(&acc, &fields))
        }
        id => Err(ProtocolError::Unsupported(id.to_string())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn numeric_op(id: &str, lhs: &Value, rhs: &Value) -> ProtocolResult<Value> {
    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let result = match id {
            "add" => a.checked_add(b),
            "sub" => a.checked_sub(b),
            "mul" => a.checked_mul(b),
            _ => None,
        };
        if let Some(value) = result {
            return Ok(json!(value));
        }
    }
    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(ProtocolError::Evaluation(format!(
            "arithmetic requires numbers, found {} and {}",
            type_name(lhs),
            type_name(rhs)
        )));
    };
    let result = match id {
        "add" => a + b,
        "sub" => a - b,
        "mul" => a * b,
        "div" => {
            if b == 0.0 {
                return Err(ProtocolError::Evaluation("division by zero".to_string()));
            }
            a / b
        }
        _ => return Err(ProtocolError::Unsupported(id.to_string())),
    };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| ProtocolError::Evaluation("non-finite arithmetic result".to_string()))
}
