//! # DataAPI Metadata Engine
//!
//! Declarative per-field metadata for a CRUD entity, and the machinery
//! that turns it into safe generic endpoints. A [`MetaBuilder`] accumulates
//! field declarations (access mode, listability, mandatory verbs,
//! sortability, foreign references, validators), named filters, and
//! endpoint definitions; freezing it yields an immutable [`DataApiMeta`].
//! Metadata inherits by merging, never by wholesale override: extending a
//! parent keeps every ancestor declaration unless the child touches the
//! same key, and per-field attributes merge attribute-wise.
//!
//! [`DataApi`] pairs a frozen meta with a [`Model`](crate::model::Model)
//! and synthesizes the default Get, List, New, Edit and Delete operations,
//! each wrappable with externally supplied guards.

mod crud;
mod filter;
mod meta;
mod registry;

pub use crud::{
    DataApi, DeleteParams, EditParams, GetParams, ListParams, ListResult, NewParams, PluckMode,
};
pub use filter::{parse_filter_param, FilterBuilder, LocalizedFilter, StandardFilter};
pub use meta::{DataApiMeta, Endpoint, EndpointGuard, FieldMeta, MetaBuilder, Operation};
pub use registry::{ApiEntry, DataApiRegistry};

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Already registered: {0}")]
    AlreadyRegistered(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Field exposure level towards API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// Whether a field appears in list results, and which stored fields it
/// needs to be computable there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listable {
    No,
    Yes,
    /// Listed, but only meaningful together with these stored fields
    /// (used by computed fields that read several raw columns).
    WithFields(Vec<String>),
}

impl Default for Listable {
    fn default() -> Self {
        Listable::Yes
    }
}

impl Listable {
    pub fn is_listed(&self) -> bool {
        !matches!(self, Listable::No)
    }
}

/// Whether list results may be sorted on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sortable {
    #[default]
    No,
    /// Sortable by value.
    Plain,
    /// Sortable through a same-named secondary index.
    Indexed,
}

/// Declared pointer from one field to another entity's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignRef {
    /// Target entity (registry name or backing table).
    pub table: String,
    /// Index on the target the field's value matches.
    pub index: String,
    /// True when the field holds an array of references.
    pub multi: bool,
}

/// Per-field value check run before writes.
pub trait Validator: Send + Sync {
    fn validate(&self, field: &str, value: &Value) -> Result<(), String>;
}

impl<F> Validator for F
where
    F: Fn(&str, &Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, field: &str, value: &Value) -> Result<(), String> {
        self(field, value)
    }
}

/// JSON type classes for [`KindValidator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Num,
    Bool,
    Array,
    Object,
}

impl ValueKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::Str => value.is_string(),
            ValueKind::Num => value.is_number(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            ValueKind::Str => "a string",
            ValueKind::Num => "a number",
            ValueKind::Bool => "a boolean",
            ValueKind::Array => "an array",
            ValueKind::Object => "an object",
        }
    }
}

/// Rejects values that are not of the declared JSON type.
#[derive(Debug, Clone, Copy)]
pub struct KindValidator {
    kind: ValueKind,
}

impl KindValidator {
    pub fn new(kind: ValueKind) -> Self {
        Self { kind }
    }
}

impl Validator for KindValidator {
    fn validate(&self, field: &str, value: &Value) -> Result<(), String> {
        if self.kind.matches(value) {
            Ok(())
        } else {
            Err(format!("field `{}` must be {}", field, self.kind.describe()))
        }
    }
}

/// Rejects strings that do not match a pattern.
#[derive(Debug, Clone)]
pub struct RegexValidator {
    pattern: regex::Regex,
}

impl RegexValidator {
    pub fn new(pattern: &str) -> ApiResult<Self> {
        let pattern = regex::Regex::new(pattern)
            .map_err(|err| ApiError::Validation(format!("invalid pattern: {}", err)))?;
        Ok(Self { pattern })
    }
}

impl Validator for RegexValidator {
    fn validate(&self, field: &str, value: &Value) -> Result<(), String> {
        let text = value
            .as_str()
            .ok_or_else(|| format!("field `{}` must be a string", field))?;
        if self.pattern.is_match(text) {
            Ok(())
        } else {
            Err(format!(
                "field `{}` does not match `{}`",
                field, self.pattern
            ))
        }
    }
}

/// Caller identity and preferences, threaded through every synthesized
/// operation and handed to guards and filter builders.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub principal: Option<String>,
    pub locale: Option<String>,
    pub attributes: Map<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Modifier arguments derived from this context, currently the locale
    /// selector when one is set.
    pub fn modifier_args(&self) -> Vec<Value> {
        self.locale
            .as_ref()
            .map(|locale| vec![Value::String(locale.clone())])
            .unwrap_or_default()
    }
}
