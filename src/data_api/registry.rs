//! Registry binding entity metadata to backing models.
//!
//! The registry is the wiring point of the DataAPI layer: each frozen
//! [`DataApiMeta`] is paired with the [`Model`] named by its model key,
//! and foreign-reference resolution walks these pairings to load target
//! rows through their own metadata.

use super::crud::DataApi;
use super::meta::DataApiMeta;
use super::ApiError;
use crate::config::EngineConfig;
use crate::error::TidewireResult;
use crate::executor::QueryExecutor;
use crate::model::Model;
use crate::schema::SchemaRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One registered entity: its metadata and the model it reads and writes
/// through.
#[derive(Clone)]
pub struct ApiEntry {
    pub meta: Arc<DataApiMeta>,
    pub model: Model,
}

/// Thread-safe collection of registered entities.
pub struct DataApiRegistry {
    entries: RwLock<HashMap<String, ApiEntry>>,
    config: Arc<EngineConfig>,
}

impl Default for DataApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataApiRegistry {
    pub fn new() -> Self {
        Self::with_config(Arc::new(EngineConfig::default()))
    }

    /// Builds a registry whose APIs share the given configuration.
    pub fn with_config(config: Arc<EngineConfig>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ApiEntry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ApiEntry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers an entity under its metadata's entity name. Each entity
    /// may be registered once.
    pub fn register(&self, meta: Arc<DataApiMeta>, model: Model) -> Result<(), ApiError> {
        let name = meta.entity().to_string();
        let mut entries = self.write();
        if entries.contains_key(&name) {
            return Err(ApiError::AlreadyRegistered(format!("entity `{}`", name)));
        }
        log::info!(
            "registered data api `{}` over table `{}`",
            name,
            model.descriptor().table()
        );
        entries.insert(name, ApiEntry { meta, model });
        Ok(())
    }

    /// Convenience wiring: looks the metadata's model key up in a schema
    /// registry, builds the model, and registers the pair.
    pub fn connect(
        &self,
        schemas: &SchemaRegistry,
        schema: &str,
        executor: Arc<dyn QueryExecutor>,
        meta: Arc<DataApiMeta>,
    ) -> TidewireResult<()> {
        let model = Model::from_registry(schemas, schema, meta.model_key(), executor)?;
        self.register(meta, model)?;
        Ok(())
    }

    /// Looks an entity up by its registered name.
    pub fn entry(&self, entity: &str) -> Result<ApiEntry, ApiError> {
        self.read()
            .get(entity)
            .cloned()
            .ok_or_else(|| ApiError::UnknownEntity(format!("`{}`", entity)))
    }

    /// Resolves a foreign-reference target. The name is tried as an
    /// entity name first, then as a backing table or model key.
    pub fn resolve(&self, target: &str) -> Option<ApiEntry> {
        let entries = self.read();
        if let Some(entry) = entries.get(target) {
            return Some(entry.clone());
        }
        entries
            .values()
            .find(|entry| {
                entry.model.descriptor().table() == target || entry.meta.model_key() == target
            })
            .cloned()
    }

    /// Builds a ready-to-dispatch [`DataApi`] for an entity, wired back
    /// to this registry for foreign-reference resolution.
    pub fn api(self: &Arc<Self>, entity: &str) -> Result<DataApi, ApiError> {
        let entry = self.entry(entity)?;
        Ok(DataApi::new(entry.meta, entry.model)
            .with_resolver(Arc::clone(self))
            .with_config(Arc::clone(&self.config)))
    }

    /// Names of every registered entity, sorted.
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DataApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataApiRegistry")
            .field("entities", &self.entities())
            .finish()
    }
}
