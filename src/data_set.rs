//! Data set descriptors and the registry they are looked up in
//!
//! A [`DataSet`] binds an id to one table on one backend, together with the columns
//! shown by default, the columns holding personal data and optional custom renderers.
//! The table's columns are discovered on first use and then kept for the lifetime of
//! the descriptor; schema changes need a restart.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use crate::column::{Column, Columns, SemanticType};
use crate::format::ColumnRenderer;
use crate::reader::{Backend, Reader};
use crate::{ExplorerError, Result};

/// Maximum number of autocomplete suggestions
pub const AUTOCOMPLETE_LIMIT: usize = 50;

/// Single suggestion returned when nothing matches. Callers show it as a hint,
/// it is not a value of the column.
pub const NO_MATCH: &str = "\tNo match";

/// A named view over one backend table
pub struct DataSet {
    pub id: String,
    pub name: String,
    backend: Arc<Backend>,
    pub schema: String,
    pub table: String,
    pub default_column_names: Vec<String>,
    pub personal_data_column_names: BTreeSet<String>,
    /// Autocomplete from `<table>_attributes(attribute, value)` instead of the table itself
    pub use_attributes_table: bool,
    pub renderers: HashMap<String, ColumnRenderer>,
    columns: OnceLock<Columns>,
}

impl DataSet {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        backend: Arc<Backend>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            backend,
            schema: schema.into(),
            table: table.into(),
            default_column_names: Vec::new(),
            personal_data_column_names: BTreeSet::new(),
            use_attributes_table: false,
            renderers: HashMap::new(),
            columns: OnceLock::new(),
        }
    }

    pub fn with_default_columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_column_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_personal_data_columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.personal_data_column_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attributes_table(mut self, enabled: bool) -> Self {
        self.use_attributes_table = enabled;
        self
    }

    pub fn with_renderer(mut self, column: impl Into<String>, renderer: ColumnRenderer) -> Self {
        self.renderers.insert(column.into(), renderer);
        self
    }

    /// Use a known schema instead of discovering it
    pub fn with_columns(self, columns: Columns) -> Self {
        let _ = self.columns.set(columns);
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Quoted `"schema"."table"` for this backend
    pub fn table_ref(&self) -> String {
        self.backend.dialect().table_ref(&self.schema, &self.table)
    }

    pub fn is_personal_data(&self, column_name: &str) -> bool {
        self.personal_data_column_names.contains(column_name)
    }

    pub fn renderer(&self, column_name: &str) -> Option<&ColumnRenderer> {
        self.renderers.get(column_name)
    }

    /// Discover the table's columns unless that already happened
    ///
    /// Two threads racing on the first call both discover; whichever stores first wins
    /// and the other result is dropped.
    pub fn ensure_loaded(&self) -> Result<&Columns> {
        if let Some(columns) = self.columns.get() {
            return Ok(columns);
        }
        let discovered = self.backend.discover_columns(&self.schema, &self.table)?;
        debug!(
            "Discovered {} columns for data set '{}'",
            discovered.len(),
            self.id
        );
        Ok(self.columns.get_or_init(|| discovered))
    }

    /// All columns of the table, in table order
    pub fn columns(&self) -> Result<&Columns> {
        self.ensure_loaded()
    }

    pub fn column(&self, name: &str) -> Result<Option<&Column>> {
        Ok(self.columns()?.get(name))
    }

    /// Values of a text column containing `term`, case-insensitively
    ///
    /// At most [`AUTOCOMPLETE_LIMIT`] values are returned. No match yields the single
    /// [`NO_MATCH`] sentinel, never an empty list.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for a personal data column when `redact_personal_data` is set;
    /// nothing is executed in that case. `ValidationError` for unknown or non-text columns.
    pub fn autocomplete_text_column(
        &self,
        column_name: &str,
        term: &str,
        redact_personal_data: bool,
    ) -> Result<Vec<String>> {
        if redact_personal_data && self.is_personal_data(column_name) {
            return Err(ExplorerError::PermissionDenied(format!(
                "Column '{}' contains personal data",
                column_name
            )));
        }
        let column = self.column(column_name)?.ok_or_else(|| {
            ExplorerError::ValidationError(format!(
                "Data set '{}' has no column '{}'",
                self.id, column_name
            ))
        })?;

        let dialect = self.backend.dialect();
        let quoted = dialect.quote_identifier(column_name);
        let pattern = dialect.quote_literal(&format!("%{}%", term));

        let sql = match column.semantic_type {
            SemanticType::TextArray => format!(
                "SELECT f
FROM (SELECT DISTINCT unnest({quoted}) AS f FROM {table}) t
WHERE f ILIKE {pattern}
ORDER BY f
LIMIT {limit}",
                table = self.table_ref(),
                limit = AUTOCOMPLETE_LIMIT,
            ),
            SemanticType::Text if self.use_attributes_table => format!(
                "SELECT value
FROM {attributes}
WHERE attribute = {attribute} AND value ILIKE {pattern}
ORDER BY value
LIMIT {limit}",
                attributes =
                    dialect.table_ref(&self.schema, &format!("{}_attributes", self.table)),
                attribute = dialect.quote_literal(column_name),
                limit = AUTOCOMPLETE_LIMIT,
            ),
            SemanticType::Text => format!(
                "SELECT DISTINCT {quoted}
FROM {table}
WHERE {quoted} ILIKE {pattern} AND {quoted} <> ''
ORDER BY {quoted}
LIMIT {limit}",
                table = self.table_ref(),
                limit = AUTOCOMPLETE_LIMIT,
            ),
            other => {
                return Err(ExplorerError::ValidationError(format!(
                    "Autocomplete needs a text column, '{}' is {}",
                    column_name, other
                )))
            }
        };

        let result = self.backend.execute(&sql)?;
        let values: Vec<String> = result
            .rows
            .iter()
            .filter_map(|row| row.first())
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();

        if values.is_empty() {
            Ok(vec![NO_MATCH.to_string()])
        } else {
            Ok(values)
        }
    }

    /// Total number of rows, 0 when the table has no discoverable columns
    pub fn row_count(&self) -> Result<i64> {
        if self.columns()?.is_empty() {
            return Ok(0);
        }
        self.backend.row_count(&self.schema, &self.table)
    }
}

impl fmt::Debug for DataSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSet")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// All configured data sets, built once at startup
#[derive(Debug, Default)]
pub struct DataSetRegistry {
    data_sets: Vec<Arc<DataSet>>,
}

impl DataSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a data set. Ids must be unique.
    pub fn insert(&mut self, data_set: DataSet) -> Result<()> {
        if self.data_sets.iter().any(|ds| ds.id == data_set.id) {
            return Err(ExplorerError::ConfigError(format!(
                "Duplicate data set id '{}'",
                data_set.id
            )));
        }
        self.data_sets.push(Arc::new(data_set));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<DataSet>> {
        self.data_sets
            .iter()
            .find(|ds| ds.id == id)
            .cloned()
            .ok_or_else(|| ExplorerError::UnknownDataSet(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataSet>> {
        self.data_sets.iter()
    }

    pub fn len(&self) -> usize {
        self.data_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_sets.is_empty()
    }

    /// Discover the columns of every data set now instead of on first use
    pub fn preload(&self) -> Result<()> {
        for data_set in &self.data_sets {
            let columns = data_set.ensure_loaded()?;
            info!(
                "Data set '{}' ({}): {} columns",
                data_set.id,
                data_set.table_ref(),
                columns.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Arc<Backend> {
        let backend = Backend::from_connection_string("duckdb://memory").unwrap();
        let Backend::DuckDB(reader) = &backend else {
            unreachable!()
        };
        reader
            .execute_batch(
                "CREATE TABLE orders(id INTEGER, name VARCHAR, email VARCHAR, tags VARCHAR[]);
                INSERT INTO orders VALUES
                    (1, 'Acme', 'a@acme.test', ['red', 'blue']),
                    (2, 'acme corp', 'b@acme.test', ['blue']),
                    (3, 'Globex', NULL, []),
                    (4, '', NULL, NULL);
                CREATE TABLE orders_attributes(attribute VARCHAR, value VARCHAR);
                INSERT INTO orders_attributes VALUES ('name', 'Acme (side table)'), ('email', 'x');",
            )
            .unwrap();
        Arc::new(backend)
    }

    fn orders(backend: Arc<Backend>) -> DataSet {
        DataSet::new("sales", "Sales", backend, "main", "orders")
            .with_default_columns(["id", "name"])
            .with_personal_data_columns(["email"])
    }

    #[test]
    fn test_columns_are_discovered() {
        let data_set = orders(backend());
        let names: Vec<&str> = data_set
            .columns()
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "name", "email", "tags"]);
        assert!(data_set.is_personal_data("email"));
        assert!(!data_set.is_personal_data("name"));
    }

    #[test]
    fn test_columns_are_discovered_once() {
        let backend = backend();
        let data_set = orders(backend.clone());
        assert_eq!(data_set.columns().unwrap().len(), 4);

        let Backend::DuckDB(reader) = backend.as_ref() else {
            unreachable!()
        };
        reader
            .execute_batch("ALTER TABLE orders ADD COLUMN extra INTEGER")
            .unwrap();

        assert_eq!(data_set.columns().unwrap().len(), 4);
    }

    #[test]
    fn test_autocomplete_text_column() {
        let data_set = orders(backend());
        let values = data_set.autocomplete_text_column("name", "ACME", true).unwrap();
        assert_eq!(values, vec!["Acme", "acme corp"]);
    }

    #[test]
    fn test_autocomplete_excludes_empty_strings() {
        let data_set = orders(backend());
        let values = data_set.autocomplete_text_column("name", "", true).unwrap();
        assert_eq!(values, vec!["Acme", "Globex", "acme corp"]);
    }

    #[test]
    fn test_autocomplete_text_array_column() {
        let data_set = orders(backend());
        let values = data_set.autocomplete_text_column("tags", "l", true).unwrap();
        assert_eq!(values, vec!["blue"]);
    }

    #[test]
    fn test_autocomplete_no_match_sentinel() {
        let data_set = orders(backend());
        let values = data_set.autocomplete_text_column("tags", "zzz", true).unwrap();
        assert_eq!(values, vec![NO_MATCH.to_string()]);
    }

    #[test]
    fn test_autocomplete_attributes_table() {
        let data_set = orders(backend()).with_attributes_table(true);
        let values = data_set.autocomplete_text_column("name", "acme", true).unwrap();
        assert_eq!(values, vec!["Acme (side table)"]);
    }

    #[test]
    fn test_autocomplete_personal_data_column() {
        let data_set = orders(backend());
        let err = data_set
            .autocomplete_text_column("email", "acme", true)
            .unwrap_err();
        assert!(matches!(err, ExplorerError::PermissionDenied(_)));

        let values = data_set
            .autocomplete_text_column("email", "acme", false)
            .unwrap();
        assert_eq!(values, vec!["a@acme.test", "b@acme.test"]);
    }

    #[test]
    fn test_autocomplete_rejects_number_column() {
        let data_set = orders(backend());
        let err = data_set.autocomplete_text_column("id", "1", true).unwrap_err();
        assert!(matches!(err, ExplorerError::ValidationError(_)));
    }

    #[test]
    fn test_row_count() {
        let data_set = orders(backend());
        assert_eq!(data_set.row_count().unwrap(), 4);
    }

    #[test]
    fn test_row_count_of_missing_table_is_zero() {
        let data_set = DataSet::new("gone", "Gone", backend(), "main", "missing");
        assert_eq!(data_set.row_count().unwrap(), 0);
    }

    #[test]
    fn test_registry_lookup() {
        let backend = backend();
        let mut registry = DataSetRegistry::new();
        registry.insert(orders(backend.clone())).unwrap();

        assert_eq!(registry.get("sales").unwrap().name, "Sales");
        assert!(matches!(
            registry.get("nope"),
            Err(ExplorerError::UnknownDataSet(_))
        ));
        assert!(matches!(
            registry.insert(orders(backend)),
            Err(ExplorerError::ConfigError(_))
        ));
        registry.preload().unwrap();
        assert_eq!(registry.len(), 1);
    }
}
