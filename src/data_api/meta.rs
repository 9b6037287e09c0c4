//! Field metadata accumulation, inheritance, and frozen per-entity meta.

use super::filter::{FilterBuilder, StandardFilter};
use super::{AccessMode, ApiResult, ForeignRef, Listable, RequestContext, Sortable, Validator};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Derives a field's value from the raw stored row at projection time.
pub type ComputedFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Everything declared about one API field.
#[derive(Clone, Default)]
pub struct FieldMeta {
    db_name: Option<String>,
    access: AccessMode,
    listable: Listable,
    mandatory: BTreeSet<String>,
    sortable: Sortable,
    foreign: Option<ForeignRef>,
    validators: Vec<Arc<dyn Validator>>,
    computed: Option<ComputedFn>,
}

impl FieldMeta {
    #[must_use]
    pub fn with_db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn read_only(self) -> Self {
        self.with_access(AccessMode::ReadOnly)
    }

    #[must_use]
    pub fn write_only(self) -> Self {
        self.with_access(AccessMode::WriteOnly)
    }

    #[must_use]
    pub fn with_listable(mut self, listed: bool) -> Self {
        self.listable = if listed { Listable::Yes } else { Listable::No };
        self
    }

    /// Marks the field listable and records the stored fields it needs.
    /// Repeated calls union and de-duplicate the requirements.
    #[must_use]
    pub fn with_listable_fields(mut self, fields: &[&str]) -> Self {
        let mut set: BTreeSet<String> = match self.listable {
            Listable::WithFields(existing) => existing.into_iter().collect(),
            _ => BTreeSet::new(),
        };
        set.extend(fields.iter().map(|field| field.to_string()));
        self.listable = Listable::WithFields(set.into_iter().collect());
        self
    }

    /// Requires the field on the named verb (`"new"`, `"edit"`).
    #[must_use]
    pub fn with_mandatory(mut self, verb: impl Into<String>) -> Self {
        self.mandatory.insert(verb.into());
        self
    }

    #[must_use]
    pub fn with_sortable(mut self) -> Self {
        self.sortable = Sortable::Plain;
        self
    }

    /// Sortable through a secondary index named after the stored field.
    #[must_use]
    pub fn with_indexed_sort(mut self) -> Self {
        self.sortable = Sortable::Indexed;
        self
    }

    #[must_use]
    pub fn with_foreign(mut self, table: impl Into<String>, index: impl Into<String>) -> Self {
        self.foreign = Some(ForeignRef {
            table: table.into(),
            index: index.into(),
            multi: false,
        });
        self
    }

    #[must_use]
    pub fn with_foreign_many(mut self, table: impl Into<String>, index: impl Into<String>) -> Self {
        self.foreign = Some(ForeignRef {
            table: table.into(),
            index: index.into(),
            multi: true,
        });
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Declares the field as derived from the raw row. Computed fields are
    /// never written, so this also makes the field read-only.
    #[must_use]
    pub fn with_computed(mut self, compute: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.computed = Some(Arc::new(compute));
        self.access = AccessMode::ReadOnly;
        self
    }

    pub fn db_name(&self) -> &str {
        self.db_name.as_deref().unwrap_or_default()
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn listable(&self) -> &Listable {
        &self.listable
    }

    pub fn mandatory(&self) -> &BTreeSet<String> {
        &self.mandatory
    }

    pub fn is_mandatory_for(&self, verb: &str) -> bool {
        self.mandatory.contains(verb)
    }

    pub fn sortable(&self) -> Sortable {
        self.sortable
    }

    pub fn foreign(&self) -> Option<&ForeignRef> {
        self.foreign.as_ref()
    }

    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }

    pub fn computed(&self) -> Option<&ComputedFn> {
        self.computed.as_ref()
    }

    pub fn is_readable(&self) -> bool {
        self.access.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.access.is_writable() && self.computed.is_none()
    }

    fn resolve_db_name(mut self, key: &str) -> Self {
        if self.db_name.is_none() {
            self.db_name = Some(key.to_string());
        }
        self
    }
}

impl fmt::Debug for FieldMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMeta")
            .field("db_name", &self.db_name)
            .field("access", &self.access)
            .field("listable", &self.listable)
            .field("mandatory", &self.mandatory)
            .field("sortable", &self.sortable)
            .field("foreign", &self.foreign)
            .field("validators", &self.validators.len())
            .field("computed", &self.computed.is_some())
            .finish()
    }
}

/// The CRUD operation an endpoint performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    List,
    New,
    Edit,
    Delete,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::New => "new",
            Operation::Edit => "edit",
            Operation::Delete => "delete",
        }
    }

    const ALL: [Operation; 5] = [
        Operation::Get,
        Operation::List,
        Operation::New,
        Operation::Edit,
        Operation::Delete,
    ];
}

/// Externally supplied requirement wrapped around an endpoint, checked
/// before the operation runs.
#[async_trait]
pub trait EndpointGuard: Send + Sync {
    async fn check(&self, ctx: &RequestContext, endpoint: &str) -> ApiResult<()>;
}

/// One dispatchable operation and the guards composed around it.
#[derive(Clone)]
pub struct Endpoint {
    operation: Operation,
    guards: Vec<Arc<dyn EndpointGuard>>,
}

impl Endpoint {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            guards: Vec::new(),
        }
    }

    /// Adds a guard. Guards run in the order they were added.
    #[must_use]
    pub fn with_guard(mut self, guard: Arc<dyn EndpointGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn guards(&self) -> &[Arc<dyn EndpointGuard>] {
        &self.guards
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("operation", &self.operation)
            .field("guards", &self.guards.len())
            .finish()
    }
}

/// Frozen metadata for one CRUD entity.
#[derive(Clone)]
pub struct DataApiMeta {
    entity: String,
    model_key: String,
    fields: BTreeMap<String, FieldMeta>,
    filters: BTreeMap<String, Arc<dyn FilterBuilder>>,
    endpoints: BTreeMap<String, Endpoint>,
}

impl DataApiMeta {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Name of the registered table/model backing this entity.
    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn field(&self, key: &str) -> Option<&FieldMeta> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldMeta)> {
        self.fields.iter().map(|(key, meta)| (key.as_str(), meta))
    }

    pub fn filter(&self, name: &str) -> Option<&Arc<dyn FilterBuilder>> {
        self.filters.get(name)
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.keys().map(String::as_str).collect()
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &Endpoint)> {
        self.endpoints.iter().map(|(key, ep)| (key.as_str(), ep))
    }
}

impl fmt::Debug for DataApiMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataApiMeta")
            .field("entity", &self.entity)
            .field("model_key", &self.model_key)
            .field("fields", &self.fields)
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// Mutable accumulator for entity metadata.
///
/// Declarations execute in order against the builder; a later call for the
/// same key augments or overrides that key only, never its siblings.
/// [`MetaBuilder::extending`] starts from a parent's frozen metadata, so
/// inheritance is a merge: ancestor declarations survive unless the child
/// touches the same key, and per-field attributes accumulate one by one.
pub struct MetaBuilder {
    entity: String,
    model_key: Option<String>,
    fields: BTreeMap<String, FieldMeta>,
    filters: BTreeMap<String, Arc<dyn FilterBuilder>>,
    endpoints: BTreeMap<String, Endpoint>,
}

impl MetaBuilder {
    /// Starts a fresh entity with the five default endpoints.
    pub fn new(entity: impl Into<String>) -> Self {
        let mut endpoints = BTreeMap::new();
        for operation in Operation::ALL {
            endpoints.insert(operation.name().to_string(), Endpoint::new(operation));
        }
        Self {
            entity: entity.into(),
            model_key: None,
            fields: BTreeMap::new(),
            filters: BTreeMap::new(),
            endpoints,
        }
    }

    /// Starts from a parent's frozen metadata. The model binding is not
    /// inherited; each entity names its own backing table.
    pub fn extending(entity: impl Into<String>, parent: &DataApiMeta) -> Self {
        Self {
            entity: entity.into(),
            model_key: None,
            fields: parent.fields.clone(),
            filters: parent.filters.clone(),
            endpoints: parent.endpoints.clone(),
        }
    }

    /// Overrides the backing table name, which defaults to the entity name.
    #[must_use]
    pub fn with_model_key(mut self, key: impl Into<String>) -> Self {
        self.model_key = Some(key.into());
        self
    }

    /// Configures one field, creating it on first mention. The closure
    /// receives the field's accumulated metadata, so re-declaring a field
    /// merges into what ancestors and earlier calls established.
    #[must_use]
    pub fn field(mut self, key: &str, configure: impl FnOnce(FieldMeta) -> FieldMeta) -> Self {
        let current = self.fields.remove(key).unwrap_or_default();
        self.fields.insert(key.to_string(), configure(current));
        self
    }

    /// Registers a named filter. Re-registering a name replaces it.
    #[must_use]
    pub fn filter(mut self, name: &str, builder: Arc<dyn FilterBuilder>) -> Self {
        self.filters.insert(name.to_string(), builder);
        self
    }

    /// Registers the stock comparison filter under `name`, matching the
    /// same-named field.
    #[must_use]
    pub fn standard_filter(self, name: &str) -> Self {
        self.filter(name, Arc::new(StandardFilter::new()))
    }

    /// Reconfigures an existing endpoint in place.
    #[must_use]
    pub fn endpoint(mut self, name: &str, configure: impl FnOnce(Endpoint) -> Endpoint) -> Self {
        match self.endpoints.remove(name) {
            Some(current) => {
                self.endpoints.insert(name.to_string(), configure(current));
            }
            None => {
                log::warn!("endpoint `{}` is not declared on `{}`", name, self.entity);
            }
        }
        self
    }

    /// Adds or replaces an endpoint wholesale.
    #[must_use]
    pub fn add_endpoint(mut self, name: &str, endpoint: Endpoint) -> Self {
        self.endpoints.insert(name.to_string(), endpoint);
        self
    }

    #[must_use]
    pub fn without_endpoint(mut self, name: &str) -> Self {
        self.endpoints.remove(name);
        self
    }

    /// Wraps an endpoint with a guard.
    #[must_use]
    pub fn guard(self, endpoint: &str, guard: Arc<dyn EndpointGuard>) -> Self {
        self.endpoint(endpoint, |ep| ep.with_guard(guard))
    }

    /// Freezes the accumulated metadata. Unset storage names resolve to
    /// their field keys here.
    pub fn freeze(self) -> Arc<DataApiMeta> {
        let model_key = self.model_key.unwrap_or_else(|| self.entity.clone());
        let fields = self
            .fields
            .into_iter()
            .map(|(key, meta)| {
                let meta = meta.resolve_db_name(&key);
                (key, meta)
            })
            .collect();
        Arc::new(DataApiMeta {
            entity: self.entity,
            model_key,
            fields,
            filters: self.filters,
            endpoints: self.endpoints,
        })
    }
}
