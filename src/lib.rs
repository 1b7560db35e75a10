/*!
# dataset-explorer - Interactive Table Exploration

Browse, filter, sort, page and summarise a single database table without writing SQL.

A data set binds an id to a backend table. Users describe what they want to see with a
[`Query`]: selected columns, filters, sort and redaction of personal data. The query is
validated against the table's discovered schema and compiled to SQL for the backend's
dialect. Row counts, per-filter counts and distributions are derived from the same filter
compilation, so every number shown next to the table agrees with the table itself.

## Example

```rust,ignore
use dataset_explorer::{Config, Query};

let config = Config::from_file("data_sets.toml")?;
let registry = config.build_registry()?;

let query = Query::new(&registry, "sales")?;
let sql = query.compile_select(Some(10), Some(0), '.', true)?;
let rows = query.run(Some(10), Some(0), true)?;
```

## Architecture

- [`reader`] - Backend adapters (DuckDB, PostgreSQL): quoting, execution, schema discovery
- [`data_set`] - Data set descriptors and the registry built from configuration
- [`query`] - Query model, SQL compiler, distributions and saved queries
- [`export`] - Streaming CSV export
- [`format`] - Template-based custom column renderers
*/

pub mod column;
pub mod config;
pub mod data_set;
pub mod export;
pub mod format;
pub mod query;
pub mod reader;
pub mod value;

// Re-export key types for convenience
pub use column::{Column, SemanticType};
pub use config::Config;
pub use data_set::{DataSet, DataSetRegistry};
pub use query::{
    Distribution, Filter, FilterValue, Operator, Query, QueryDict, QueryStore, SortOrder,
};
pub use reader::{Backend, Reader};
pub use value::{ResultSet, Value};

/// Main library error type
#[derive(thiserror::Error, Debug)]
pub enum ExplorerError {
    #[error("Data set '{0}' does not exist (anymore)")]
    UnknownDataSet(String),

    #[error("Query '{query_id}' of data set '{data_set_id}' does not exist")]
    UnknownQuery {
        data_set_id: String,
        query_id: String,
    },

    #[error("Unsupported column type '{native_type}' of column '{column}'")]
    UnsupportedColumnType { column: String, native_type: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Data source error: {0}")]
    ReaderError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Export error: {0}")]
    ExportError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ExplorerError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
