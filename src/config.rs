//! Configuration file
//!
//! Backends, data sets and the saved-query store are described in one TOML file:
//!
//! ```toml
//! [connections.warehouse]
//! url = "duckdb://warehouse.duckdb"
//!
//! [query_store]
//! url = "duckdb://queries.duckdb"
//!
//! [[data_sets]]
//! id = "sales"
//! name = "Sales"
//! connection = "warehouse"
//! schema = "main"
//! table = "orders"
//! default_columns = ["id", "name"]
//! personal_data_columns = ["email"]
//!
//! [data_sets.renderers]
//! name = "<b>{}</b>"
//! ```

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::data_set::{DataSet, DataSetRegistry};
use crate::format::ColumnRenderer;
use crate::query::DuckDBQueryStore;
use crate::reader::Backend;
use crate::{ExplorerError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryStoreConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSetConfig {
    pub id: String,
    pub name: String,
    /// Key into `[connections]`
    pub connection: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub default_columns: Vec<String>,
    #[serde(default)]
    pub personal_data_columns: Vec<String>,
    #[serde(default)]
    pub use_attributes_table: bool,
    #[serde(default)]
    pub renderers: HashMap<String, ColumnRenderer>,
}

fn default_schema() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
    #[serde(default)]
    pub query_store: Option<QueryStoreConfig>,
    #[serde(default)]
    pub data_sets: Vec<DataSetConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExplorerError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ExplorerError::ConfigError(format!("Invalid configuration: {}", e)))
    }

    /// Connect the backends and register every data set
    ///
    /// One backend is created per connection entry and shared by the data sets using it.
    /// No schema is discovered here; see [`DataSetRegistry::preload`].
    pub fn build_registry(&self) -> Result<DataSetRegistry> {
        let mut backends: HashMap<&str, Arc<Backend>> = HashMap::new();
        for (name, connection) in &self.connections {
            let backend = Backend::from_connection_string(&connection.url).map_err(|e| {
                ExplorerError::ConfigError(format!("Connection '{}': {}", name, e))
            })?;
            backends.insert(name.as_str(), Arc::new(backend));
        }

        let mut registry = DataSetRegistry::new();
        for ds in &self.data_sets {
            let backend = backends.get(ds.connection.as_str()).ok_or_else(|| {
                ExplorerError::ConfigError(format!(
                    "Data set '{}' uses unknown connection '{}'",
                    ds.id, ds.connection
                ))
            })?;
            let mut data_set = DataSet::new(
                ds.id.as_str(),
                ds.name.as_str(),
                Arc::clone(backend),
                ds.schema.as_str(),
                ds.table.as_str(),
            )
            .with_default_columns(ds.default_columns.iter().cloned())
            .with_personal_data_columns(ds.personal_data_columns.iter().cloned())
            .with_attributes_table(ds.use_attributes_table);
            for (column, renderer) in &ds.renderers {
                data_set = data_set.with_renderer(column.as_str(), renderer.clone());
            }
            registry.insert(data_set)?;
        }

        info!(
            "Registered {} data sets on {} connections",
            registry.len(),
            backends.len()
        );
        Ok(registry)
    }

    /// Open the configured saved-query store, if any
    pub fn open_query_store(&self) -> Result<Option<DuckDBQueryStore>> {
        self.query_store
            .as_ref()
            .map(|store| {
                DuckDBQueryStore::open(&store.url).map_err(|e| {
                    ExplorerError::ConfigError(format!("Query store '{}': {}", store.url, e))
                })
            })
            .transpose()
    }
}
