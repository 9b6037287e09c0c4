//! # Tidewire
//!
//! A declarative data-access layer: queries are captured lazily as typed
//! expression chains, realized into a portable intermediate representation,
//! and executed remotely over a small cursor-based protocol. On top of the
//! query layer sit per-field value transforms, a schema registry with a
//! thin model API, and a metadata-driven CRUD engine.
//!
//! ## Core Components
//!
//! * `query` - Category-typed proxy expressions and the chainable query builder
//! * `ir` - Portable, serializable query representation
//! * `executor` - Remote execution protocol with cursors and change feeds
//! * `modifier` - Per-field transform pipeline (digests, passwords, sealing, localization)
//! * `schema` - Table descriptors and the schema registry
//! * `model` - Row-level data access that applies modifiers around the executor
//! * `data_api` - Per-field metadata compiled into generic CRUD endpoints
//! * `config` - Engine configuration loading
//! * `error` - Unified error types
//!
//! ## Architecture
//!
//! Building a query never touches the network: chains accumulate steps in a
//! [`query::QueryBuilder`] and type errors surface while composing, not when
//! running. Realizing a chain produces an [`ir::QueryContext`] that any
//! [`executor::QueryExecutor`] can run to completion or serve incrementally
//! through sequential cursors; a chain ending in `changes` becomes a feed
//! that only ends when closed.
//!
//! Models wrap an executor with per-field modifier stacks declared in the
//! schema registry, so values are transformed on the way in and, where the
//! transform is reversible, on the way out. The DataAPI layer reads
//! per-field metadata to synthesize Get, List, New, Edit and Delete over a
//! model, enforcing access modes, mandatory sets, validators and declared
//! filters for every caller.

pub mod config;
pub mod data_api;
pub mod error;
pub mod executor;
pub mod ir;
pub mod logging;
pub mod model;
pub mod modifier;
pub mod query;
pub mod schema;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use data_api::{DataApi, DataApiMeta, DataApiRegistry, MetaBuilder, RequestContext};
pub use error::{TidewireError, TidewireResult};
pub use executor::{Cursor, QueryExecutor};
pub use ir::QueryContext;
pub use model::{Model, WriteReport};
pub use modifier::{FieldModifier, ModifierStack};
pub use query::QueryBuilder;
pub use schema::{SchemaRegistry, TableDescriptor};
