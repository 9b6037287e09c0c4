//! # Entity Schema Registry
//!
//! Process-wide catalog of table shapes. A [`TableDescriptor`] names a
//! table's primary key, its secondary indexes, the modifier stacks attached
//! to individual fields, and an optional fixture generator used to seed the
//! table the first time it is created. Registration is validated once;
//! lookups hand out shared immutable descriptors.

use crate::modifier::{FieldModifier, ModifierStack, MODS_KEY};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Row keys reserved for the data layer's own bookkeeping. User fields may
/// not collide with these.
pub static RESERVED_KEYS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    let mut keys = BTreeSet::new();
    keys.insert(MODS_KEY);
    keys
});

#[derive(Debug, Clone)]
pub enum SchemaError {
    AlreadyRegistered(String),
    UnknownTable(String),
    UnknownIndex(String),
    InvalidDescriptor(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchemaError::AlreadyRegistered(msg) => write!(f, "Already registered: {}", msg),
            SchemaError::UnknownTable(msg) => write!(f, "Unknown table: {}", msg),
            SchemaError::UnknownIndex(msg) => write!(f, "Unknown index: {}", msg),
            SchemaError::InvalidDescriptor(msg) => write!(f, "Invalid descriptor: {}", msg),
        }
    }
}

impl std::error::Error for SchemaError {}

/// A secondary index over one or more row fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub fields: Vec<String>,
}

/// Generator for seed rows, invoked once when a table is first created.
pub type FixtureFn = Arc<dyn Fn() -> Vec<Value> + Send + Sync>;

/// Immutable description of one table.
#[derive(Clone)]
pub struct TableDescriptor {
    table: String,
    primary_key: String,
    indexes: Vec<IndexDef>,
    attachments: BTreeMap<String, ModifierStack>,
    fixture: Option<FixtureFn>,
}

impl TableDescriptor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: "id".to_string(),
            indexes: Vec::new(),
            attachments: BTreeMap::new(),
            fixture: None,
        }
    }

    #[must_use]
    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    /// Declares a single-field index named after the field.
    #[must_use]
    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.indexes.push(IndexDef {
            name: field.clone(),
            fields: vec![field],
        });
        self
    }

    /// Declares a named compound index over several fields.
    #[must_use]
    pub fn with_compound_index(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        self.indexes.push(IndexDef {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    /// Attaches a modifier to `field`. Repeated calls build the field's
    /// stack in declaration order, which is also the order applied on write.
    #[must_use]
    pub fn with_modifier(
        mut self,
        field: impl Into<String>,
        modifier: Arc<dyn FieldModifier>,
    ) -> Self {
        self.attachments.entry(field.into()).or_default().push(modifier);
        self
    }

    #[must_use]
    pub fn with_fixture(mut self, fixture: impl Fn() -> Vec<Value> + Send + Sync + 'static) -> Self {
        self.fixture = Some(Arc::new(fixture));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    pub fn index(&self, name: &str) -> Result<&IndexDef, SchemaError> {
        self.indexes
            .iter()
            .find(|idx| idx.name == name)
            .ok_or_else(|| {
                SchemaError::UnknownIndex(format!("`{}` on table `{}`", name, self.table))
            })
    }

    /// Modifier stack attached to `field`, if any.
    pub fn stack(&self, field: &str) -> Option<&ModifierStack> {
        self.attachments.get(field)
    }

    pub fn modified_fields(&self) -> impl Iterator<Item = (&str, &ModifierStack)> {
        self.attachments.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Evaluates the fixture generator, if one was declared.
    pub fn fixture_rows(&self) -> Option<Vec<Value>> {
        self.fixture.as_ref().map(|f| f())
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.table.is_empty() {
            return Err(SchemaError::InvalidDescriptor(
                "table name must not be empty".to_string(),
            ));
        }
        if self.primary_key.is_empty() {
            return Err(SchemaError::InvalidDescriptor(format!(
                "table `{}` has an empty primary key",
                self.table
            )));
        }
        if RESERVED_KEYS.contains(self.primary_key.as_str()) {
            return Err(SchemaError::InvalidDescriptor(format!(
                "primary key `{}` is a reserved key",
                self.primary_key
            )));
        }
        let mut index_names = BTreeSet::new();
        for index in &self.indexes {
            if index.fields.is_empty() {
                return Err(SchemaError::InvalidDescriptor(format!(
                    "index `{}` on `{}` has no fields",
                    index.name, self.table
                )));
            }
            if !index_names.insert(index.name.as_str()) {
                return Err(SchemaError::InvalidDescriptor(format!(
                    "duplicate index `{}` on `{}`",
                    index.name, self.table
                )));
            }
        }
        for field in self.attachments.keys() {
            if RESERVED_KEYS.contains(field.as_str()) {
                return Err(SchemaError::InvalidDescriptor(format!(
                    "field `{}` is a reserved key",
                    field
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDescriptor")
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("indexes", &self.indexes)
            .field("modified_fields", &self.attachments.keys().collect::<Vec<_>>())
            .field("has_fixture", &self.fixture.is_some())
            .finish()
    }
}

/// Registry of descriptors keyed by (schema namespace, table name).
#[derive(Default)]
pub struct SchemaRegistry {
    inner: RwLock<HashMap<String, HashMap<String, Arc<TableDescriptor>>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, Arc<TableDescriptor>>>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, Arc<TableDescriptor>>>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Validates and registers a descriptor. Registering the same
    /// (schema, table) pair twice is an error.
    pub fn register(&self, schema: &str, descriptor: TableDescriptor) -> Result<(), SchemaError> {
        descriptor.validate()?;
        let mut registry = self.write();
        let namespace = registry.entry(schema.to_string()).or_default();
        if namespace.contains_key(descriptor.table()) {
            return Err(SchemaError::AlreadyRegistered(format!(
                "table `{}.{}`",
                schema,
                descriptor.table()
            )));
        }
        log::info!("registered table `{}.{}`", schema, descriptor.table());
        namespace.insert(descriptor.table().to_string(), Arc::new(descriptor));
        Ok(())
    }

    pub fn descriptor(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Arc<TableDescriptor>, SchemaError> {
        self.read()
            .get(schema)
            .and_then(|ns| ns.get(table))
            .cloned()
            .ok_or_else(|| SchemaError::UnknownTable(format!("`{}.{}`", schema, table)))
    }

    pub fn contains(&self, schema: &str, table: &str) -> bool {
        self.read()
            .get(schema)
            .map(|ns| ns.contains_key(table))
            .unwrap_or(false)
    }

    /// Table names registered under `schema`, sorted.
    pub fn tables(&self, schema: &str) -> Vec<String> {
        let mut tables: Vec<String> = self
            .read()
            .get(schema)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        tables.sort();
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::DigestModifier;
    use serde_json::json;

    #[test]
    fn test_register_and_lookup() {
        let registry = SchemaRegistry::new();
        registry
            .register("app", TableDescriptor::new("articles").with_index("title"))
            .unwrap();
        let descriptor = registry.descriptor("app", "articles").unwrap();
        assert_eq!(descriptor.primary_key(), "id");
        assert_eq!(descriptor.index("title").unwrap().fields, vec!["title"]);
        assert!(matches!(
            registry.descriptor("app", "missing"),
            Err(SchemaError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = SchemaRegistry::new();
        registry.register("app", TableDescriptor::new("articles")).unwrap();
        assert!(matches!(
            registry.register("app", TableDescriptor::new("articles")),
            Err(SchemaError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_reserved_field_names_are_rejected() {
        let registry = SchemaRegistry::new();
        let descriptor = TableDescriptor::new("articles")
            .with_modifier(MODS_KEY, Arc::new(DigestModifier::new()));
        assert!(matches!(
            registry.register("app", descriptor),
            Err(SchemaError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_duplicate_index_names_are_rejected() {
        let registry = SchemaRegistry::new();
        let descriptor = TableDescriptor::new("articles")
            .with_index("title")
            .with_compound_index("title", &["title", "id"]);
        assert!(matches!(
            registry.register("app", descriptor),
            Err(SchemaError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_fixture_rows_are_generated_on_demand() {
        let descriptor = TableDescriptor::new("articles")
            .with_fixture(|| vec![json!({"id": "seed-1"}), json!({"id": "seed-2"})]);
        let rows = descriptor.fixture_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(TableDescriptor::new("bare").fixture_rows().is_none());
    }

    #[test]
    fn test_modifier_stack_preserves_declaration_order() {
        let descriptor = TableDescriptor::new("articles")
            .with_modifier("body", Arc::new(DigestModifier::new()))
            .with_modifier("body", Arc::new(DigestModifier::new()));
        assert_eq!(descriptor.stack("body").unwrap().len(), 2);
    }
}
