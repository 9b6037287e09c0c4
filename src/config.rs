//! # Engine Configuration
//!
//! Runtime settings for the data-access layer, loadable from a TOML file
//! or assembled in code. Everything has a sensible default so embedders
//! can start with `EngineConfig::default()` and override selectively.

use crate::error::{TidewireError, TidewireResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Settings consulted by the DataAPI layer and by secret-bearing
/// modifiers at wiring time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page size applied when a list request names none.
    pub default_page: u64,
    /// Hard ceiling on list page sizes. Callers may lower it per request
    /// but never raise it.
    pub max_page: u64,
    /// Named secrets handed to sealing modifiers. Keys are attachment
    /// names chosen by the embedder.
    pub secrets: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page: 20,
            max_page: 100,
            secrets: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> TidewireResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            TidewireError::Config(format!(
                "cannot read `{}`: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        Self::parse(&text)
    }

    /// Parses a TOML document. Unknown keys are tolerated so config
    /// files may carry sections for other parts of an application.
    pub fn parse(text: &str) -> TidewireResult<Self> {
        toml::from_str(text).map_err(|err| TidewireError::Config(err.to_string()))
    }

    /// Looks up a named secret.
    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }
}
